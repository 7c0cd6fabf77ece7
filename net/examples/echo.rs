use std::net::SocketAddr;

use ripple_net::{EventLoop, ServerOption, TcpServer};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .expect("invalid listen address");
    let threads: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    let lp = EventLoop::new().expect("failed to create main loop");

    let mut server =
        TcpServer::new(&lp, addr, "echo", ServerOption::NoReusePort).expect("failed to bind");
    server.set_thread_num(threads);
    server.set_connection_callback(|conn| {
        if conn.connected() {
            tracing::info!(peer = %conn.peer_addr(), "client connected");
        } else {
            tracing::info!(peer = %conn.peer_addr(), "client gone");
        }
    });
    server.set_message_callback(|conn, buf, _at| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    });

    server.start().expect("failed to start server");
    tracing::info!(%addr, threads, "echo server running");
    lp.run();
}
