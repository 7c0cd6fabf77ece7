//! Shared scaffolding for the end-to-end tests.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use ripple_net::{EventLoop, LoopHandle, ServerOption, TcpServer};

/// A server running on its own main-loop thread.
pub struct TestServer {
    pub handle: LoopHandle,
    pub addr: SocketAddr,
    join: thread::JoinHandle<()>,
}

impl TestServer {
    /// Bind an ephemeral port, apply `configure`, start, and run the main
    /// loop on a fresh thread.
    pub fn start(
        threads: usize,
        configure: impl FnOnce(&mut TcpServer) + Send + 'static,
    ) -> TestServer {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let mut server =
                TcpServer::new(&lp, listen, "test", ServerOption::NoReusePort).unwrap();
            server.set_thread_num(threads);
            configure(&mut server);
            server.start().unwrap();
            tx.send((lp.handle(), server.listen_addr().unwrap())).unwrap();
            lp.run();
        });
        let (handle, addr) = rx.recv().unwrap();
        while !handle.is_looping() {
            thread::yield_now();
        }
        TestServer { handle, addr, join }
    }

    pub fn stop(self) {
        self.handle.quit();
        self.join.join().unwrap();
    }
}

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}
