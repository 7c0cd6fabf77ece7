//! Listening-socket owner on the main loop.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use tracing::{error, info, warn};

use crate::channel::{ChannelHandler, ChannelId};
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// TCP listen backlog.
const BACKLOG: i32 = 1024;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

/// Accepts connections on the main loop and hands the descriptors to the
/// server's dispatch callback.
///
/// Holds a reserve descriptor on `/dev/null`: when the process runs out of
/// descriptors the reserve is released, the pending connection accepted and
/// immediately closed, and the reserve re-acquired, so a full accept queue
/// cannot wedge a level-triggered listener.
pub(crate) struct Acceptor {
    socket: Socket,
    channel: Cell<Option<ChannelId>>,
    listening: Cell<bool>,
    idle_fd: Cell<RawFd>,
    on_new_connection: RefCell<Option<NewConnectionCallback>>,
}

fn open_idle_fd() -> RawFd {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

impl Acceptor {
    pub(crate) fn new(listen_addr: SocketAddr, reuse_port: bool) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::listener(listen_addr)?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        Ok(Arc::new(Acceptor {
            socket,
            channel: Cell::new(None),
            listening: Cell::new(false),
            idle_fd: Cell::new(open_idle_fd()),
            on_new_connection: RefCell::new(None),
        }))
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_new_connection.borrow_mut() = Some(cb);
    }

    /// Address the listener is actually bound to.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn channel_id(&self) -> Option<ChannelId> {
        self.channel.get()
    }

    /// Start listening and register read interest on the main loop.
    pub(crate) fn listen(self: &Arc<Self>, lp: &EventLoop) -> io::Result<()> {
        if self.listening.get() {
            return Ok(());
        }
        self.listening.set(true);
        self.socket.listen(BACKLOG)?;

        let self_dyn: Arc<dyn ChannelHandler> = self.clone();
        let tie: Weak<dyn ChannelHandler> = Arc::downgrade(&self_dyn);
        let id = lp.add_channel(self.socket.fd(), tie);
        self.channel.set(Some(id));
        lp.enable_reading(id);

        info!(addr = %self.local_addr()?, "listening");
        Ok(())
    }

    /// Accept one connection; spurious readiness is a no-op under
    /// level-triggered notification.
    fn accept_one(&self) {
        match self.socket.accept() {
            Ok((socket, peer)) => {
                CONNECTIONS_ACCEPTED.increment();
                let mut cb = self.on_new_connection.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(socket, peer),
                    None => drop(socket),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(error = %e, "accept failed");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.drain_with_reserve();
                }
            }
        }
    }

    /// Descriptor exhaustion: use the reserve to pop and close the pending
    /// connection so the listener does not report it forever.
    fn drain_with_reserve(&self) {
        warn!("descriptor limit reached; draining accept queue via reserve fd");
        unsafe {
            libc::close(self.idle_fd.get());
            let accepted = libc::accept(self.socket.fd(), std::ptr::null_mut(), std::ptr::null_mut());
            if accepted >= 0 {
                libc::close(accepted);
            }
            self.idle_fd.set(open_idle_fd());
        }
    }
}

impl ChannelHandler for Acceptor {
    fn handle_read(&self, _lp: &EventLoop, _at: Timestamp) {
        self.accept_one();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let fd = self.idle_fd.get();
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
