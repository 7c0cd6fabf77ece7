//! Cross-loop sends and consistent-hash stickiness.

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use common::{wait_until, TestServer};
use ripple_net::{EventLoopThread, TcpConnectionPtr};

#[test]
fn test_cross_loop_send_is_ordered_before_followup() {
    // The connection lives on the server's single subordinate loop; a timer
    // on an unrelated loop sends through it.
    let conn_slot: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));
    let slot = conn_slot.clone();

    let server = TestServer::start(1, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *slot.lock() = Some(conn.clone());
            }
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || conn_slot.lock().is_some()));
    let conn = conn_slot.lock().clone().unwrap();

    let foreign = EventLoopThread::start("foreign-loop", None).unwrap();
    assert!(!foreign.handle().same_loop(conn.owner_loop()));

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    foreign.handle().run_after(Duration::from_millis(20), move |_| {
        // This send crosses from the foreign loop to the owner loop; the
        // follow-up enqueued immediately after must come out second.
        conn.send(b"y");
        let conn2 = conn.clone();
        conn.owner_loop().queue_in_loop(move |_| conn2.send(b"z"));
        fired2.fetch_add(1, Ordering::SeqCst);
    });

    let mut got = [0u8; 2];
    client.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"yz");
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Exactly once: no further bytes arrive before the timeout.
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut extra = [0u8; 1];
    match client.read(&mut extra) {
        Err(e) => assert!(matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )),
        Ok(n) => panic!("unexpected extra {n} byte(s) after the cross-loop send"),
    }

    drop(foreign);
    server.stop();
}

#[test]
fn test_same_peer_sticks_to_one_loop() {
    // Every connection from the same peer IP must land on the same
    // subordinate loop; the handling thread identifies the loop.
    let threads_seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = threads_seen.clone();

    let server = TestServer::start(3, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                seen.lock().push(std::thread::current().id());
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        });
    });

    const CONNS: usize = 100;
    for _ in 0..CONNS {
        use std::io::Write;
        let mut client = TcpStream::connect(server.addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || {
        threads_seen.lock().len() == CONNS
    }));
    let seen = threads_seen.lock();
    assert!(
        seen.iter().all(|&t| t == seen[0]),
        "connections from one peer IP spread across loops"
    );

    server.stop();
}
