// src/tls.rs
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};

use crate::error::{EtudeError, EtudeResult};
use crate::syscalls;

/// Builds a TLS 1.2+ server configuration from PEM files.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> EtudeResult<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| EtudeError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| EtudeError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> EtudeResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EtudeError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(EtudeError::Tls(format!("{}: no certificates found", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> EtudeResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EtudeError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| EtudeError::Tls(format!("{}: no private key found", path.display())))
}

fn open(path: &Path) -> EtudeResult<File> {
    File::open(path).map_err(|e| EtudeError::Tls(format!("{}: {e}", path.display())))
}

/// `io::Read`/`io::Write` over a raw non-blocking descriptor.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        syscalls::read_nonblocking(self.0, buf)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        syscalls::write_nonblocking(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Done,
    WantRead,
    WantWrite,
}

/// Server side of one TLS connection over a non-blocking socket.
///
/// Every method returns `ErrorKind::WouldBlock` (or a `Want*` status) when
/// the socket cannot make progress; the caller re-arms the reactor for the
/// matching direction and calls again on the next event.
pub struct TlsSession {
    conn: ServerConnection,
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>) -> EtudeResult<Self> {
        let conn = ServerConnection::new(config).map_err(|e| EtudeError::Tls(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Drives the handshake as far as the socket allows.
    pub fn handshake(&mut self, fd: RawFd) -> io::Result<Handshake> {
        let mut io = FdIo(fd);
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut io) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Handshake::WantWrite),
                    Err(e) => return Err(e),
                }
            }
            if !self.conn.wants_read() {
                return Ok(Handshake::WantRead);
            }
            match self.conn.read_tls(&mut io) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => self.process(fd)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Handshake::WantRead),
                Err(e) => return Err(e),
            }
        }
        // final flight and session tickets
        match self.flush(fd) {
            Ok(()) => Ok(Handshake::Done),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Handshake::WantWrite),
            Err(e) => Err(e),
        }
    }

    /// Reads decrypted application data. `Ok(0)` means the peer closed.
    pub fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            if self.conn.read_tls(&mut FdIo(fd))? == 0 {
                return Ok(0);
            }
            self.process(fd)?;
        }
    }

    /// Encrypts as much of `buf` as the session buffer takes and pushes as
    /// many records as the socket accepts. `WouldBlock` when the buffer is
    /// full and the socket will not drain it; call [`flush`](Self::flush)
    /// until it succeeds to finish sending.
    pub fn write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        match self.flush(fd) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    /// Writes pending TLS records; `WouldBlock` while some remain.
    pub fn flush(&mut self, fd: RawFd) -> io::Result<()> {
        let mut io = FdIo(fd);
        while self.conn.wants_write() {
            self.conn.write_tls(&mut io)?;
        }
        Ok(())
    }

    pub fn send_close_notify(&mut self, fd: RawFd) {
        self.conn.send_close_notify();
        let _ = self.flush(fd);
    }

    fn process(&mut self, fd: RawFd) -> io::Result<()> {
        if let Err(err) = self.conn.process_new_packets() {
            // best effort: let the peer see the alert
            let _ = self.flush(fd);
            return Err(io::Error::new(io::ErrorKind::InvalidData, err));
        }
        Ok(())
    }
}
