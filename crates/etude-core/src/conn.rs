// src/conn.rs
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, warn};

use crate::error::ParseError;
use crate::http::Response;
use crate::metrics::ServerMetrics;
use crate::parser::{Progress, RequestParser};
use crate::reactor::{Interest, Reactor};
use crate::router::Router;
use crate::syscalls;
#[cfg(feature = "tls")]
use crate::tls::{Handshake, TlsSession};
use crate::writer;

pub const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Reading,
    Dispatching,
    Writing,
    Closing,
}

/// What the reactor should do with the descriptor after a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Parked until the next readiness event.
    Pending,
    Close,
}

pub enum Transport {
    Plain,
    #[cfg(feature = "tls")]
    Tls(Box<TlsSession>),
}

impl Transport {
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain => syscalls::read_nonblocking(fd, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read(fd, buf),
        }
    }

    fn write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain => syscalls::write_nonblocking(fd, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.write(fd, buf),
        }
    }

    fn flush(&mut self, _fd: RawFd) -> io::Result<()> {
        match self {
            Transport::Plain => Ok(()),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.flush(_fd),
        }
    }
}

/// Borrowed server state a connection needs while it is being driven.
pub struct ConnEnv<'a> {
    pub router: &'a Router,
    pub reactor: &'a Reactor,
    pub metrics: &'a ServerMetrics,
}

/// One accepted client socket and everything needed to resume it.
///
/// Only the worker currently scheduled for the socket touches it.
pub struct Conn {
    fd: RawFd,
    token: usize,
    peer: Option<SocketAddr>,
    state: ConnState,
    transport: Transport,
    parser: RequestParser,
    write_buf: Vec<u8>,
    write_pos: usize,
    keep_alive: bool,
    /// Whether writable readiness is currently part of the interest set.
    want_write: bool,
    requests_served: u64,
}

impl Conn {
    pub fn new(fd: RawFd, token: usize, peer: Option<SocketAddr>, transport: Transport, body_limit: usize) -> Self {
        let state = match transport {
            Transport::Plain => ConnState::Reading,
            #[cfg(feature = "tls")]
            Transport::Tls(_) => ConnState::Handshaking,
        };
        Self {
            fd,
            token,
            peer,
            state,
            transport,
            parser: RequestParser::new(body_limit),
            write_buf: Vec::new(),
            write_pos: 0,
            keep_alive: false,
            want_write: false,
            requests_served: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Runs the state machine until the socket would block or the
    /// connection is finished.
    pub fn on_ready(&mut self, env: &ConnEnv<'_>) -> Outcome {
        loop {
            match self.state {
                ConnState::Handshaking => {
                    if let Some(outcome) = self.handshake(env) {
                        return outcome;
                    }
                }
                ConnState::Reading => {
                    if let Some(outcome) = self.read() {
                        return outcome;
                    }
                }
                ConnState::Dispatching => self.dispatch(env),
                ConnState::Writing => {
                    if let Some(outcome) = self.write(env) {
                        return outcome;
                    }
                }
                ConnState::Closing => return Outcome::Close,
            }
        }
    }

    /// Deregisters and closes the socket.
    pub fn close(mut self, reactor: &Reactor) {
        self.state = ConnState::Closing;
        #[cfg(feature = "tls")]
        if let Transport::Tls(s) = &mut self.transport {
            if !s.is_handshaking() {
                s.send_close_notify(self.fd);
            }
        }
        if let Err(e) = reactor.deregister(self.fd) {
            debug!(fd = self.fd, error = %e, "deregister failed");
        }
        syscalls::close_fd(self.fd);
    }

    #[cfg(feature = "tls")]
    fn handshake(&mut self, env: &ConnEnv<'_>) -> Option<Outcome> {
        let Transport::Tls(session) = &mut self.transport else {
            self.state = ConnState::Reading;
            return None;
        };
        match session.handshake(self.fd) {
            Ok(Handshake::Done) => {
                self.state = ConnState::Reading;
                if self.want_write {
                    self.set_interest(env, false);
                }
                None
            }
            Ok(Handshake::WantRead) => {
                if self.want_write {
                    self.set_interest(env, false);
                }
                Some(Outcome::Pending)
            }
            Ok(Handshake::WantWrite) => {
                if !self.want_write {
                    self.set_interest(env, true);
                }
                Some(Outcome::Pending)
            }
            Err(e) => {
                warn!(peer = ?self.peer, error = %e, "TLS handshake failed");
                Some(Outcome::Close)
            }
        }
    }

    #[cfg(not(feature = "tls"))]
    fn handshake(&mut self, _env: &ConnEnv<'_>) -> Option<Outcome> {
        self.state = ConnState::Reading;
        None
    }

    fn read(&mut self) -> Option<Outcome> {
        // bytes left over from the previous request on this connection
        if self.parser.has_buffered() {
            let progress = self.parser.poll();
            if self.on_progress(progress) {
                return None;
            }
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.transport.read(self.fd, &mut buf) {
                Ok(0) => return Some(Outcome::Close),
                Ok(n) => {
                    let progress = self.parser.append(&buf[..n]);
                    if self.on_progress(progress) {
                        return None;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Some(Outcome::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = ?self.peer, error = %e, "read failed");
                    return Some(Outcome::Close);
                }
            }
        }
    }

    /// Returns true when the state moved on from `Reading`.
    fn on_progress(&mut self, progress: Progress) -> bool {
        match progress {
            Progress::NeedMore => false,
            Progress::Ready => {
                self.state = ConnState::Dispatching;
                true
            }
            Progress::Error(err) => {
                debug!(peer = ?self.peer, error = %err, "rejecting request");
                self.queue_error(err);
                true
            }
        }
    }

    fn queue_error(&mut self, err: ParseError) {
        let message = match err {
            ParseError::BodyTooLarge => "Payload Too Large",
            _ => "Bad Request",
        };
        self.keep_alive = false;
        self.write_buf.clear();
        self.write_pos = 0;
        writer::write_response(
            &mut self.write_buf,
            Response::error(err.status(), message),
            false,
            false,
        );
        self.state = ConnState::Writing;
    }

    fn dispatch(&mut self, env: &ConnEnv<'_>) {
        let Some(req) = self.parser.take_request() else {
            self.state = ConnState::Reading;
            return;
        };
        let mut keep_alive = req.keep_alive();
        let gzip = req.accepts_gzip();

        let response = match catch_unwind(AssertUnwindSafe(|| env.router.route(&req))) {
            Ok(res) => res,
            Err(payload) => {
                error!(
                    method = %req.method,
                    path = %req.path,
                    panic = panic_message(&*payload),
                    "handler panicked"
                );
                keep_alive = false;
                Response::internal_error()
            }
        };

        self.requests_served += 1;
        env.metrics.inc_req();

        self.keep_alive = keep_alive;
        self.write_buf.clear();
        self.write_pos = 0;
        writer::write_response(&mut self.write_buf, response, keep_alive, gzip);
        self.state = ConnState::Writing;
    }

    fn write(&mut self, env: &ConnEnv<'_>) -> Option<Outcome> {
        while self.write_pos < self.write_buf.len() {
            match self.transport.write(self.fd, &self.write_buf[self.write_pos..]) {
                Ok(0) => return Some(Outcome::Close),
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Some(self.wait_writable(env)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = ?self.peer, error = %e, "write failed");
                    return Some(Outcome::Close);
                }
            }
        }
        match self.transport.flush(self.fd) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Some(self.wait_writable(env)),
            Err(e) => {
                debug!(peer = ?self.peer, error = %e, "flush failed");
                return Some(Outcome::Close);
            }
        }

        env.metrics.add_bytes(self.write_buf.len());
        self.write_buf.clear();
        self.write_pos = 0;
        if self.want_write {
            self.set_interest(env, false);
        }

        if !self.keep_alive {
            return Some(Outcome::Close);
        }
        self.parser.reset();
        self.state = ConnState::Reading;
        None
    }

    fn wait_writable(&mut self, env: &ConnEnv<'_>) -> Outcome {
        if !self.want_write {
            self.set_interest(env, true);
        }
        Outcome::Pending
    }

    fn set_interest(&mut self, env: &ConnEnv<'_>, writable: bool) {
        let interest = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match env.reactor.modify(self.fd, self.token, interest) {
            Ok(()) => self.want_write = writable,
            Err(e) => {
                warn!(fd = self.fd, error = %e, "failed to update reactor interest");
                self.state = ConnState::Closing;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
