//! Per-connection I/O state machine.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::buffer::Buffer;
use crate::channel::{ChannelHandler, ChannelId};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Default output-buffer size above which the high-water-mark callback fires.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One accepted TCP connection, owned end-to-end by a single loop.
///
/// Shared between the server's connection table and in-flight cross-loop
/// tasks; the channel in the owner loop holds only a weak tie back here.
/// State transitions, buffer mutation, and interest changes happen on the
/// owner loop exclusively — `send`, `shutdown`, and `send_file` may be called
/// from any thread and dispatch themselves there.
pub struct TcpConnection {
    me: Weak<TcpConnection>,
    owner: LoopHandle,
    name: String,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    high_water_mark: AtomicUsize,
    // Locked only from the owner loop; the locks exist to make the handle
    // shareable across loops, not to arbitrate real contention.
    channel: Mutex<Option<ChannelId>>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    pub(crate) fn new(
        owner: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        if let Err(e) = socket.set_keepalive(true) {
            error!(name = %name, error = %e, "failed to enable keep-alive");
        }
        debug!(name = %name, fd = socket.fd(), "connection created");
        Arc::new_cyclic(|me| TcpConnection {
            me: me.clone(),
            owner,
            name,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(State::Connecting as u8),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            channel: Mutex::new(None),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    #[inline]
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Handle of the loop that owns this connection.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.owner
    }

    /// Install the high-water-mark callback and threshold for this
    /// connection.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.callbacks.lock().high_water_mark = Some(Arc::new(cb));
    }

    pub(crate) fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        self.callbacks.lock().connection = cb;
    }

    pub(crate) fn set_message_callback(&self, cb: Option<MessageCallback>) {
        self.callbacks.lock().message = cb;
    }

    pub(crate) fn set_write_complete_callback(&self, cb: Option<WriteCompleteCallback>) {
        self.callbacks.lock().write_complete = cb;
    }

    pub(crate) fn set_close_callback(&self, cb: Option<CloseCallback>) {
        self.callbacks.lock().close = cb;
    }

    /// Send bytes to the peer. Callable from any thread; off-loop callers
    /// get a copy of the bytes enqueued to the owner loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.owner.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_in_loop(&lp, data);
                return;
            }
        }
        let me = self.clone();
        let data = data.to_vec();
        self.owner.run_in_loop(move |lp| me.send_in_loop(lp, &data));
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let me = self.clone();
            self.owner.run_in_loop(move |lp| me.shutdown_in_loop(lp));
        }
    }

    /// Stream `count` bytes of `file` starting at `offset` to the peer via
    /// the kernel's file-to-socket copy. Short copies re-queue the remainder
    /// as a deferred task instead of staging bytes in user space.
    pub fn send_file(self: &Arc<Self>, file: Arc<File>, offset: u64, count: usize) {
        if self.state() != State::Connected {
            error!(name = %self.name, "send_file on a connection that is not connected");
            return;
        }
        if self.owner.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_file_in_loop(&lp, &file, offset, count);
                return;
            }
        }
        let me = self.clone();
        self.owner
            .run_in_loop(move |lp| me.send_file_in_loop(lp, &file, offset, count));
    }

    /// First write goes straight to the socket; only the unsent remainder is
    /// staged in the output buffer, which keeps steady-state memory bounded
    /// by the high-water mark.
    fn send_in_loop(self: &Arc<Self>, lp: &EventLoop, data: &[u8]) {
        if self.state() == State::Disconnected {
            error!(name = %self.name, "disconnected, give up writing");
            return;
        }
        let Some(id) = *self.channel.lock() else {
            return;
        };

        let mut wrote = 0usize;
        let mut fault = false;
        let mut output = self.output.lock();

        if !lp.is_writing(id) && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.socket.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                wrote = n as usize;
                BYTES_SENT.add(wrote as u64);
                if wrote == data.len() {
                    self.queue_write_complete(lp);
                }
            } else {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, error = %e, "direct write failed");
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - wrote;
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len < mark && old_len + remaining >= mark {
                let cb = self.callbacks.lock().high_water_mark.clone();
                if let Some(cb) = cb {
                    let me = self.clone();
                    let size = old_len + remaining;
                    lp.queue_in_loop(move |_| cb(&me, size));
                }
            }
            output.append(&data[wrote..]);
            if !lp.is_writing(id) {
                lp.enable_writing(id);
            }
        }
    }

    fn send_file_in_loop(self: &Arc<Self>, lp: &EventLoop, file: &Arc<File>, offset: u64, count: usize) {
        if self.state() == State::Disconnected {
            error!(name = %self.name, "disconnected, give up sending file");
            return;
        }
        let Some(id) = *self.channel.lock() else {
            return;
        };

        let mut sent = 0usize;
        let mut fault = false;
        let output_empty = self.output.lock().readable_bytes() == 0;

        if !lp.is_writing(id) && output_empty {
            let mut off = offset as libc::off_t;
            let n = unsafe { libc::sendfile(self.socket.fd(), file.as_raw_fd(), &mut off, count) };
            if n >= 0 {
                sent = n as usize;
                BYTES_SENT.add(sent as u64);
                if sent == count {
                    self.queue_write_complete(lp);
                }
            } else {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, error = %e, "sendfile failed");
                }
                if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                    fault = true;
                }
            }
        }

        let remaining = count - sent;
        if !fault && remaining > 0 {
            let me = self.clone();
            let file = file.clone();
            let next_offset = offset + sent as u64;
            lp.queue_in_loop(move |lp| me.send_file_in_loop(lp, &file, next_offset, remaining));
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        let writing = self
            .channel
            .lock()
            .map_or(false, |id| lp.is_writing(id));
        // Only half-close once the output buffer has fully drained;
        // handle_write finishes the job otherwise.
        if !writing {
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, error = %e, "shutdown write failed");
            }
        }
    }

    fn queue_write_complete(self: &Arc<Self>, lp: &EventLoop) {
        let cb = self.callbacks.lock().write_complete.clone();
        if let Some(cb) = cb {
            let me = self.clone();
            lp.queue_in_loop(move |_| cb(&me));
        }
    }

    /// Runs on the owner loop once the server has wired callbacks: ties the
    /// channel, enables read interest, and reports the connection up.
    pub(crate) fn connect_established(self: &Arc<Self>, lp: &EventLoop) {
        self.set_state(State::Connected);

        let self_dyn: Arc<dyn ChannelHandler> = self.clone();
        let tie: Weak<dyn ChannelHandler> = Arc::downgrade(&self_dyn);
        let id = lp.add_channel(self.socket.fd(), tie);
        *self.channel.lock() = Some(id);
        lp.enable_reading(id);

        CONNECTIONS_ACTIVE.increment();
        info!(name = %self.name, peer = %self.peer_addr, "connection up");

        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Final teardown on the owner loop. Reports the connection down when
    /// the close path has not already done so, then unregisters the channel.
    pub(crate) fn connect_destroyed(self: &Arc<Self>, lp: &EventLoop) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            if let Some(id) = *self.channel.lock() {
                lp.disable_all(id);
            }
            CONNECTIONS_ACTIVE.decrement();
            info!(name = %self.name, peer = %self.peer_addr, "connection down");

            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(self);
            }
        }
        if let Some(id) = self.channel.lock().take() {
            lp.remove_channel(id);
        }
    }

    fn do_read(self: &Arc<Self>, lp: &EventLoop, at: Timestamp) {
        let mut input = self.input.lock();
        match input.read_fd(self.socket.fd()) {
            Ok(0) => {
                drop(input);
                self.do_close(lp);
            }
            Ok(n) => {
                BYTES_RECEIVED.add(n as u64);
                let cb = self.callbacks.lock().message.clone();
                match cb {
                    Some(cb) => cb(self, &mut input, at),
                    // Nobody consuming: discard so the buffer cannot grow
                    // without bound.
                    None => input.retrieve_all(),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!(name = %self.name, error = %e, "read failed");
                self.do_error(lp);
            }
        }
    }

    fn do_write(self: &Arc<Self>, lp: &EventLoop) {
        let Some(id) = *self.channel.lock() else {
            return;
        };
        if !lp.is_writing(id) {
            trace!(name = %self.name, "write readiness after interest cleared");
            return;
        }

        let mut output = self.output.lock();
        match output.write_fd(self.socket.fd()) {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    lp.disable_writing(id);
                    self.queue_write_complete(lp);
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop(lp);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!(name = %self.name, error = %e, "drain write failed");
            }
        }
    }

    fn do_close(self: &Arc<Self>, lp: &EventLoop) {
        if self.state() == State::Disconnected {
            return;
        }
        debug!(name = %self.name, state = ?self.state(), "closing");
        self.set_state(State::Disconnected);
        if let Some(id) = *self.channel.lock() {
            lp.disable_all(id);
        }
        CONNECTIONS_ACTIVE.decrement();
        info!(name = %self.name, peer = %self.peer_addr, "connection down");

        // A strong reference carries the connection through both callbacks;
        // once the server's close callback removes the table entry, it may be
        // the only remaining owner.
        let conn = self.clone();
        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = connection_cb {
            cb(&conn);
        }
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    /// Fetch and log the pending socket error; recovery happens through the
    /// close notification that follows.
    fn do_error(&self, _lp: &EventLoop) {
        let mut optval: libc::c_int = 0;
        let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.socket.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut optval as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        let err = if ret < 0 {
            io::Error::last_os_error()
        } else {
            io::Error::from_raw_os_error(optval)
        };
        error!(name = %self.name, so_error = %err, "socket error");
    }
}

impl ChannelHandler for TcpConnection {
    fn handle_read(&self, lp: &EventLoop, at: Timestamp) {
        if let Some(me) = self.me.upgrade() {
            me.do_read(lp, at);
        }
    }

    fn handle_write(&self, lp: &EventLoop) {
        if let Some(me) = self.me.upgrade() {
            me.do_write(lp);
        }
    }

    fn handle_close(&self, lp: &EventLoop) {
        if let Some(me) = self.me.upgrade() {
            me.do_close(lp);
        }
    }

    fn handle_error(&self, lp: &EventLoop) {
        self.do_error(lp);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(name = %self.name, fd = self.socket.fd(), state = ?self.state(), "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in [
            State::Connecting,
            State::Connected,
            State::Disconnecting,
            State::Disconnected,
        ] {
            assert_eq!(State::from_u8(s as u8), s);
        }
    }
}
