//! Thin wrapper over a TCP socket descriptor.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket as Sock, Type};

/// Owns one TCP descriptor; closing happens on drop.
#[derive(Debug)]
pub(crate) struct Socket {
    inner: Sock,
}

impl Socket {
    /// Create a non-blocking, close-on-exec stream socket suitable for
    /// listening on `addr`.
    pub(crate) fn listener(addr: SocketAddr) -> io::Result<Socket> {
        let inner = Sock::new(
            Domain::for_address(addr),
            Type::STREAM.nonblocking().cloexec(),
            Some(Protocol::TCP),
        )?;
        Ok(Socket { inner })
    }

    /// Wrap a socket handed out by `accept`.
    pub(crate) fn from_accepted(inner: Sock) -> io::Result<Socket> {
        inner.set_nonblocking(true)?;
        Ok(Socket { inner })
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn set_reuse_address(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub(crate) fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub(crate) fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.bind(&addr.into())
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection; the returned socket is non-blocking
    /// and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (sock, addr) = self.inner.accept()?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
        Ok((Socket::from_accepted(sock)?, peer))
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "non-IP local address")
        })
    }

    /// Half-close the write side, leaving reads open.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }
}
