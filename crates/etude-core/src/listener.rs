// src/listener.rs
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::syscalls;

/// Non-blocking listening socket.
#[derive(Debug)]
pub struct Listener {
    fd: RawFd,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds with `SO_REUSEADDR` and the system maximum backlog. Port 0
    /// picks a free port; see [`local_addr`](Self::local_addr).
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let fd = syscalls::create_listen_socket(&addr)?;
        let local_addr = match syscalls::local_addr(fd) {
            Ok(a) => a,
            Err(e) => {
                syscalls::close_fd(fd);
                return Err(e);
            }
        };
        Ok(Self { fd, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Accepts one client. `Ok(None)` once the backlog is empty; the
    /// returned descriptor is already non-blocking.
    pub fn accept(&self) -> io::Result<Option<(RawFd, Option<SocketAddr>)>> {
        syscalls::accept_connection(self.fd)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        syscalls::close_fd(self.fd);
    }
}
