//! End-to-end scenario: a client opens a connection, sends two
//! newline-framed lines in one burst, and gets back each captured line
//! echoed on its own reply (spec §8, scenarios 1-2).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mio::net::TcpListener as MioTcpListener;

use posix_sessions::tcp::session::{run_service, Session, SessionHandlers, SessionService};

fn request(service: &mut SessionService<(), ()>, session: Session, _global: &mut ()) {
    let mut captured = Vec::new();
    service.scan(session, &mut [Some(&mut captured)]);
    captured.push(b'\n');
    service.reply(session, captured).unwrap();
}

#[test]
fn echoes_each_framed_line() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let listener = MioTcpListener::from_std(std_listener);

    let (ready_tx, ready_rx) = mpsc::channel();
    thread::spawn(move || {
        let handlers = SessionHandlers {
            open: None,
            request,
            close: None,
        };
        ready_tx.send(()).unwrap();
        run_service(listener, b"(.*)\n", handlers, ()).unwrap();
    });

    ready_rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello\nworld\n").unwrap();

    let mut buf = [0u8; 64];
    let mut total = Vec::new();
    while total.len() < b"hello\nworld\n".len() {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before both replies arrived");
        total.extend_from_slice(&buf[..n]);
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(total, b"hello\nworld\n");
}

#[test]
fn split_packet_framing_still_matches() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let listener = MioTcpListener::from_std(std_listener);

    let (ready_tx, ready_rx) = mpsc::channel();
    thread::spawn(move || {
        let handlers = SessionHandlers {
            open: None,
            request,
            close: None,
        };
        ready_tx.send(()).unwrap();
        run_service(listener, b"(.*)\n", handlers, ()).unwrap();
    });

    ready_rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"par").unwrap();
    thread::sleep(Duration::from_millis(20));
    client.write_all(b"tial\n").unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"partial\n");
}

/// Request handler for the many-session counter scenario: a line of the
/// form `(global )?-?\d+\r\n` either accumulates into a service-wide global
/// counter (shared across every connection) or into this connection's own
/// running total, and replies with whichever counter it just updated.
fn counter_request(service: &mut SessionService<i64, i64>, session: Session, global: &mut i64) {
    let mut marker = Vec::new();
    let mut number = Vec::new();
    service.scan(session, &mut [Some(&mut marker), Some(&mut number)]);

    let n: i64 = std::str::from_utf8(&number)
        .expect("capture group is ascii digits")
        .parse()
        .expect("capture group matched -?\\d+");

    let value = if marker == b"global" {
        *global += n;
        *global
    } else {
        let session_total = service.session_handle_mut(session).expect("live session");
        *session_total += n;
        *session_total
    };

    let mut reply = value.to_string().into_bytes();
    reply.extend_from_slice(b"\r\n");
    service.reply(session, reply).unwrap();
}

/// Reads from `stream` until at least `expect` worth of bytes have arrived
/// and asserts they equal `expect` exactly — mirrors the accumulate-then-
/// compare style of the other tests in this file.
fn expect_reply(stream: &mut TcpStream, expect: &[u8]) {
    let mut total = Vec::new();
    let mut buf = [0u8; 64];
    while total.len() < expect.len() {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before the expected reply arrived");
        total.extend_from_slice(&buf[..n]);
    }
    assert_eq!(total, expect);
}

#[test]
fn many_sessions_share_a_global_counter_and_keep_their_own() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let listener = MioTcpListener::from_std(std_listener);

    let (ready_tx, ready_rx) = mpsc::channel();
    thread::spawn(move || {
        let handlers = SessionHandlers {
            open: None,
            request: counter_request,
            close: None,
        };
        ready_tx.send(()).unwrap();
        run_service(
            listener,
            br"(?:(global) )?(-?\d+)\r\n",
            handlers,
            0i64,
        )
        .unwrap();
    });

    ready_rx.recv().unwrap();

    let mut conn_a = TcpStream::connect(addr).unwrap();
    let mut conn_b = TcpStream::connect(addr).unwrap();

    conn_a.write_all(b"5\r\n").unwrap();
    expect_reply(&mut conn_a, b"5\r\n");

    conn_a.write_all(b"3\r\n").unwrap();
    expect_reply(&mut conn_a, b"8\r\n");

    conn_b.write_all(b"global 10\r\n").unwrap();
    expect_reply(&mut conn_b, b"10\r\n");

    conn_a.write_all(b"global 1\r\n").unwrap();
    expect_reply(&mut conn_a, b"11\r\n");
}
