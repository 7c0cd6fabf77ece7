//! TCP server: acceptor plus subordinate-loop pool plus connection table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Listener socket option for the server constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerOption {
    #[default]
    NoReusePort,
    ReusePort,
}

#[derive(Default)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

/// The part of the server shared with close callbacks running on
/// subordinate loops. The connection table is mutated only through tasks
/// posted to the main loop.
struct ServerInner {
    name: String,
    ip_port: String,
    main: LoopHandle,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    callbacks: Mutex<UserCallbacks>,
    next_conn_id: AtomicU64,
}

impl ServerInner {
    /// Dispatch removal to the main loop; destruction is then deferred to
    /// the connection's owner loop. The strong handle captured by the
    /// destroy task keeps the connection alive until that task runs.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let inner = self.clone();
        let conn = conn.clone();
        let main = self.main.clone();
        main.run_in_loop(move |_| {
            info!(server = %inner.name, conn = %conn.name(), "removing connection");
            inner.connections.lock().remove(conn.name());
            let owner = conn.owner_loop().clone();
            let conn = conn.clone();
            owner.queue_in_loop(move |lp| conn.connect_destroyed(lp));
        });
    }

    /// Runs on the main loop for every accepted descriptor: pick a
    /// subordinate by peer address, register the connection, wire callbacks,
    /// and hand establishment to the chosen loop.
    fn new_connection(
        self: &Arc<Self>,
        pool: &Rc<RefCell<EventLoopThreadPool>>,
        socket: Socket,
        peer: SocketAddr,
    ) {
        let io_loop = pool.borrow().get_next_loop(&peer.ip().to_string());

        // Main-loop only, so the serial needs no stronger ordering.
        let serial = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, self.ip_port, serial);
        info!(server = %self.name, conn = %name, peer = %peer, "new connection");

        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(conn = %name, error = %e, "getsockname failed");
                peer
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), name.clone(), socket, local, peer);
        {
            let cbs = self.callbacks.lock();
            conn.set_connection_callback(cbs.connection.clone());
            conn.set_message_callback(cbs.message.clone());
            conn.set_write_complete_callback(cbs.write_complete.clone());
        }
        let inner = self.clone();
        conn.set_close_callback(Some(Arc::new(move |c: &TcpConnectionPtr| {
            inner.remove_connection(c);
        })));

        self.connections.lock().insert(name, conn.clone());
        io_loop.run_in_loop(move |lp| conn.connect_established(lp));
    }
}

/// Multi-reactor TCP server.
///
/// Lives on the main loop's thread. The acceptor and the connection table
/// belong to the main loop; each accepted connection is owned end-to-end by
/// the subordinate loop the consistent-hash ring selects for its peer
/// address.
pub struct TcpServer {
    lp: EventLoop,
    inner: Arc<ServerInner>,
    acceptor: Arc<Acceptor>,
    pool: Rc<RefCell<EventLoopThreadPool>>,
    thread_init: Option<ThreadInitCallback>,
    started: AtomicU32,
}

impl TcpServer {
    pub fn new(
        lp: &EventLoop,
        listen_addr: SocketAddr,
        name: &str,
        option: ServerOption,
    ) -> Result<TcpServer> {
        let acceptor =
            Acceptor::new(listen_addr, option == ServerOption::ReusePort).map_err(Error::Bind)?;

        let inner = Arc::new(ServerInner {
            name: name.to_string(),
            ip_port: listen_addr.to_string(),
            main: lp.handle(),
            connections: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(UserCallbacks::default()),
            next_conn_id: AtomicU64::new(1),
        });
        let pool = Rc::new(RefCell::new(EventLoopThreadPool::new(lp.handle(), name)));

        {
            let inner = inner.clone();
            let pool = pool.clone();
            acceptor.set_new_connection_callback(Box::new(move |socket, peer| {
                inner.new_connection(&pool, socket, peer);
            }));
        }

        Ok(TcpServer {
            lp: lp.clone(),
            inner,
            acceptor,
            pool,
            thread_init: None,
            started: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The address the listener is bound to; useful when binding port 0.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr().map_err(Error::Io)
    }

    /// Number of subordinate loops; zero leaves all I/O on the main loop.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.pool.borrow_mut().set_thread_num(num_threads);
    }

    /// Virtual nodes per subordinate loop on the selection ring.
    pub fn set_virtual_nodes(&mut self, replicas: usize) {
        self.pool.borrow_mut().set_virtual_nodes(replicas);
    }

    pub fn set_thread_init_callback(&mut self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        self.thread_init = Some(Arc::new(cb));
    }

    /// Invoked on connection up and on the transition to down.
    pub fn set_connection_callback(&mut self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.inner.callbacks.lock().connection = Some(Arc::new(cb));
    }

    /// Invoked on every non-empty read with the input buffer; the callback
    /// consumes what it handles via the buffer's retrieve operations.
    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().message = Some(Arc::new(cb));
    }

    /// Invoked on the owner loop when the output buffer drains to empty.
    pub fn set_write_complete_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Start the subordinate loops and begin accepting. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.started.fetch_add(1, Ordering::AcqRel) == 0 {
            self.pool.borrow_mut().start(self.thread_init.clone())?;
            let acceptor = self.acceptor.clone();
            let mut listen_result = Ok(());
            self.lp.run_in_loop(|lp| listen_result = acceptor.listen(lp));
            listen_result.map_err(Error::Io)?;
            info!(server = %self.inner.name, addr = %self.inner.ip_port, "server started");
        }
        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(id) = self.acceptor.channel_id() {
            self.lp.remove_channel(id);
        }
        // Each connection is destroyed on its owner loop; the task's strong
        // handle is what keeps it alive that long.
        let conns: Vec<TcpConnectionPtr> =
            self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let owner = conn.owner_loop().clone();
            owner.queue_in_loop(move |lp| conn.connect_destroyed(lp));
        }
        // The pool drops after this body, quitting and joining every
        // subordinate loop; the queued destroy tasks drain first.
    }
}
