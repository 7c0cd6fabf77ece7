//! Framework metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently established connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read from peers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to peers")]
pub static BYTES_SENT: Counter = Counter::new();
