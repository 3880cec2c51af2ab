// src/server.rs
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conn::{Conn, ConnEnv, Outcome, Transport};
use crate::error::{EtudeError, EtudeResult};
use crate::listener::Listener;
use crate::metrics::ServerMetrics;
use crate::reactor::{Events, Interest, Reactor};
use crate::router::Router;
use crate::slab::Slab;
use crate::syscalls;
use crate::worker::{WorkerPool, WorkerPoolConfig};

const LISTENER_TOKEN: usize = usize::MAX;
const WAKE_TOKEN: usize = usize::MAX - 1;

/// Upper bound on simultaneously open client connections.
pub const MAX_CONNECTIONS: usize = 65_536;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const SCHEDULED_AGAIN: u8 = 2;

/// A connection plus the bit that keeps at most one task in flight for it.
struct Slot {
    token: usize,
    sched: AtomicU8,
    conn: Mutex<Option<Conn>>,
}

impl Slot {
    /// Returns true when the caller must submit a drain task.
    fn schedule(&self) -> bool {
        let mut cur = self.sched.load(Ordering::Acquire);
        loop {
            let next = match cur {
                IDLE => SCHEDULED,
                SCHEDULED => SCHEDULED_AGAIN,
                _ => return false,
            };
            match self
                .sched
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return cur == IDLE,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns true when the slot went idle; false means another event
    /// arrived during the drain and the caller must drain again.
    fn release(&self) -> bool {
        match self
            .sched
            .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                self.sched.store(SCHEDULED, Ordering::Release);
                false
            }
        }
    }

    fn conn(&self) -> MutexGuard<'_, Option<Conn>> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct Shared {
    router: Router,
    reactor: Reactor,
    conns: Mutex<Slab<Arc<Slot>>>,
    metrics: ServerMetrics,
}

impl Shared {
    fn conns(&self) -> MutexGuard<'_, Slab<Arc<Slot>>> {
        self.conns.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn env(&self) -> ConnEnv<'_> {
        ConnEnv {
            router: &self.router,
            reactor: &self.reactor,
            metrics: &self.metrics,
        }
    }

    /// Worker side: drain until idle, closing the connection if it is done.
    fn drive(&self, slot: &Slot) {
        loop {
            let outcome = match slot.conn().as_mut() {
                Some(conn) => conn.on_ready(&self.env()),
                None => return,
            };
            if outcome == Outcome::Close {
                self.close(slot);
                return;
            }
            if slot.release() {
                return;
            }
        }
    }

    fn close(&self, slot: &Slot) {
        let Some(conn) = slot.conn().take() else {
            return;
        };
        debug!(token = slot.token, peer = ?conn.peer(), served = conn.requests_served(), "closing connection");
        conn.close(&self.reactor);
        self.conns().remove(slot.token);
        self.metrics.dec_conn();
    }
}

struct WakeFd(RawFd);

impl Drop for WakeFd {
    fn drop(&mut self) {
        syscalls::close_fd(self.0);
    }
}

struct ShutdownInner {
    requested: AtomicBool,
    wake: WakeFd,
}

/// Stops a running [`Server`] from any thread. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.inner.requested.swap(true, Ordering::AcqRel) {
            if let Err(e) = syscalls::notify_pipe(self.inner.wake.0) {
                warn!(error = %e, "failed to wake reactor");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }
}

/// HTTP/1.1 server: one reactor thread plus a dynamic worker pool.
pub struct Server {
    config: Config,
    listener: Listener,
    wake_read: WakeFd,
    shutdown: ShutdownHandle,
    shared: Arc<Shared>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Server {
    /// Binds the listening socket and sets up the reactor. Fails on an
    /// invalid configuration, an unusable address, or unreadable TLS files.
    pub fn bind(config: Config, router: Router) -> EtudeResult<Self> {
        config.validate()?;

        #[cfg(feature = "tls")]
        let tls = if config.tls {
            Some(crate::tls::load_server_config(&config.tls_cert_path, &config.tls_key_path)?)
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        if config.tls {
            return Err(EtudeError::Config("built without the `tls` feature".into()));
        }

        let listener = Listener::bind(config.server_addr()?)?;
        let reactor = Reactor::new()?;
        reactor.register(listener.fd(), LISTENER_TOKEN, Interest::READABLE)?;

        let (wake_r, wake_w) = syscalls::create_pipe()?;
        let wake_read = WakeFd(wake_r);
        let wake_write = WakeFd(wake_w);
        reactor.register(wake_read.0, WAKE_TOKEN, Interest::READABLE)?;

        Ok(Self {
            config,
            listener,
            wake_read,
            shutdown: ShutdownHandle {
                inner: Arc::new(ShutdownInner {
                    requested: AtomicBool::new(false),
                    wake: wake_write,
                }),
            },
            shared: Arc::new(Shared {
                router,
                reactor,
                conns: Mutex::new(Slab::with_max(MAX_CONNECTIONS)),
                metrics: ServerMetrics::new(),
            }),
            #[cfg(feature = "tls")]
            tls,
        })
    }

    /// The bound address; resolves port 0 to the port actually chosen.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.shared.metrics
    }

    /// Runs the reactor on the calling thread until shut down.
    pub fn serve(self) -> EtudeResult<()> {
        let pool = WorkerPool::new(WorkerPoolConfig {
            min: self.config.worker_min,
            max: self.config.worker_max,
            idle_interval: self.config.worker_idle_interval(),
        })?;
        let metrics_thread = self.spawn_metrics_logger();

        info!(
            addr = %self.local_addr(),
            tls = self.config.tls,
            worker_min = self.config.worker_min,
            worker_max = self.config.worker_max,
            "etude listening"
        );

        let mut events = Events::with_capacity(self.config.max_events);
        let result = loop {
            if self.shutdown.is_shutdown() {
                break Ok(());
            }
            if let Err(e) = self.shared.reactor.wait(&mut events, None) {
                break Err(EtudeError::Io(e));
            }
            for ev in events.iter() {
                match ev.token() {
                    LISTENER_TOKEN => self.accept_all(),
                    WAKE_TOKEN => syscalls::drain_pipe(self.wake_read.0),
                    token => self.dispatch(token, &pool),
                }
            }
        };

        info!("shutting down");
        pool.shutdown();
        let open: Vec<Arc<Slot>> = self.shared.conns().drain().collect();
        for slot in &open {
            if let Some(conn) = slot.conn().take() {
                conn.close(&self.shared.reactor);
                self.shared.metrics.dec_conn();
            }
        }
        if let Some((stop, handle)) = metrics_thread {
            stop.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        }
        info!(closed = open.len(), "server stopped");
        result
    }

    fn accept_all(&self) {
        loop {
            match self.listener.accept() {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => return,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&self, fd: RawFd, peer: Option<SocketAddr>) {
        let transport = match self.transport() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to create TLS session");
                syscalls::close_fd(fd);
                return;
            }
        };
        let body_limit = self.config.body_limit_bytes;

        let token = self.shared.conns().insert_with(|token| {
            Arc::new(Slot {
                token,
                sched: AtomicU8::new(IDLE),
                conn: Mutex::new(Some(Conn::new(fd, token, peer, transport, body_limit))),
            })
        });
        let Some(token) = token else {
            warn!(?peer, "connection table full, refusing client");
            syscalls::close_fd(fd);
            return;
        };

        self.shared.metrics.inc_conn();
        if let Err(e) = self.shared.reactor.register(fd, token, Interest::READABLE) {
            warn!(error = %e, "failed to register client");
            let slot = self.shared.conns().get(token).cloned();
            if let Some(slot) = slot {
                self.shared.close(&slot);
            }
            return;
        }
        debug!(token, ?peer, "accepted connection");
    }

    #[cfg(feature = "tls")]
    fn transport(&self) -> EtudeResult<Transport> {
        match &self.tls {
            Some(cfg) => Ok(Transport::Tls(Box::new(crate::tls::TlsSession::new(cfg.clone())?))),
            None => Ok(Transport::Plain),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn transport(&self) -> EtudeResult<Transport> {
        Ok(Transport::Plain)
    }

    fn dispatch(&self, token: usize, pool: &WorkerPool) {
        let Some(slot) = self.shared.conns().get(token).cloned() else {
            return;
        };
        if slot.schedule() {
            let shared = self.shared.clone();
            pool.submit(move || shared.drive(&slot));
        }
    }

    fn spawn_metrics_logger(&self) -> Option<(Arc<AtomicBool>, JoinHandle<()>)> {
        if self.config.metrics_interval_secs == 0 {
            return None;
        }
        let interval = Duration::from_secs(self.config.metrics_interval_secs);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let shared = self.shared.clone();

        let handle = thread::Builder::new()
            .name("etude-metrics".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let m = shared.metrics.snapshot();
                    info!(
                        active_connections = m.active_connections,
                        requests = m.requests,
                        bytes_sent = m.bytes_sent,
                        "metrics"
                    );
                }
            });
        match handle {
            Ok(h) => Some((stop, h)),
            Err(e) => {
                warn!(error = %e, "failed to start metrics thread");
                None
            }
        }
    }
}
