//! End-to-end echo and connection-lifecycle tests.

mod common;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, TestServer};

#[test]
fn test_echo_round_trip() {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let (ups2, downs2) = (ups.clone(), downs.clone());

    let server = TestServer::start(3, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                ups2.fetch_add(1, Ordering::SeqCst);
            } else {
                downs2.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello\n");

    drop(client);
    assert!(wait_until(Duration::from_secs(2), || {
        downs.load(Ordering::SeqCst) == 1
    }));
    // Exactly one up and one down, down after up.
    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(downs.load(Ordering::SeqCst), 1);

    server.stop();
}

#[test]
fn test_echo_many_messages() {
    let server = TestServer::start(2, |server| {
        server.set_message_callback(|conn, buf, _at| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    for i in 0..50u32 {
        let msg = format!("message-{i}\n");
        client.write_all(msg.as_bytes()).unwrap();
        let mut echoed = vec![0u8; msg.len()];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, msg.as_bytes());
    }

    server.stop();
}

#[test]
fn test_peer_half_close() {
    let downs = Arc::new(AtomicUsize::new(0));
    let downs2 = downs.clone();

    let server = TestServer::start(1, move |server| {
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                downs2.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"x").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // The byte written before the half-close still comes back, then the
    // server observes end-of-stream and tears the connection down.
    let mut echoed = [0u8; 1];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"x");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    assert!(wait_until(Duration::from_secs(2), || {
        downs.load(Ordering::SeqCst) == 1
    }));

    server.stop();
}

#[test]
fn test_many_sequential_connections() {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let (ups2, downs2) = (ups.clone(), downs.clone());

    let server = TestServer::start(3, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                ups2.fetch_add(1, Ordering::SeqCst);
            } else {
                downs2.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
        });
    });

    const CONNS: usize = 20;
    for i in 0..CONNS {
        let mut client = TcpStream::connect(server.addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let msg = format!("conn-{i}");
        client.write_all(msg.as_bytes()).unwrap();
        let mut echoed = vec![0u8; msg.len()];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, msg.as_bytes());
    }

    assert!(wait_until(Duration::from_secs(3), || {
        downs.load(Ordering::SeqCst) == CONNS
    }));
    assert_eq!(ups.load(Ordering::SeqCst), CONNS);

    server.stop();
}
