//! Multi-reactor TCP server framework.
//!
//! One event loop per thread: a main loop accepts connections and hands each
//! one to a subordinate loop selected by a consistent-hash ring over peer
//! addresses; every subordinate loop owns its connections end-to-end. The
//! hot path (poll, dispatch, read/write) stays allocation-light, and all
//! cross-loop work travels through per-loop deferred-task queues with
//! eventfd wakeups.

pub(crate) mod acceptor;
pub mod buffer;
pub(crate) mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod hash_ring;
pub mod metrics;
pub mod pool;
pub(crate) mod poller;
pub mod server;
pub(crate) mod socket;
pub(crate) mod timer;
pub mod timestamp;

// Public API re-exports
pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use hash_ring::HashRing;
pub use pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use server::{ServerOption, TcpServer};
pub use timestamp::Timestamp;
