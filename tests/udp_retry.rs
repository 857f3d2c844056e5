//! End-to-end scenarios over the session-ful UDP layer: the scenario 4
//! happy path (one datagram echoed straight back) and its retry path (the
//! client never acknowledges, forcing the server to retransmit the head of
//! its output queue up to `max_retries` times before closing the link).

use std::io::ErrorKind;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mio::net::UdpSocket as MioUdpSocket;

use posix_sessions::udp::mux::{LinkHandle, UdpHandlers, UdpMux};

fn open(mux: &mut UdpMux<(), ()>, link: LinkHandle, global: &mut ()) -> () {
    input(mux, link, global)
}

fn input(mux: &mut UdpMux<(), ()>, link: LinkHandle, _global: &mut ()) {
    let mut buf = [0u8; 2048];
    if let Ok(n) = mux.read(link, &mut buf) {
        let _ = mux.enqueue(link, buf[..n].to_vec());
    }
}

fn close(_mux: &mut UdpMux<(), ()>, _handle: (), _global: &mut ()) {}

#[test]
fn echoes_one_datagram() {
    let std_socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = std_socket.local_addr().unwrap();
    std_socket.set_nonblocking(true).unwrap();
    let listener = MioUdpSocket::from_std(std_socket);

    let (ready_tx, ready_rx) = mpsc::channel();
    thread::spawn(move || {
        let mux: UdpMux<(), ()> = UdpMux::new(listener, 200, 5).unwrap();
        let handlers = UdpHandlers { open, input, close };
        ready_tx.send(()).unwrap();
        mux.run(handlers, &mut ()).unwrap();
    });

    ready_rx.recv().unwrap();

    let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(b"ping", addr).unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
}

/// Open handler for the retry test: echo the opening datagram once, same as
/// the happy-path `open`/`input` above, but the client below never answers
/// back, so this single enqueued reply is the one the server must retry.
fn echo_once(mux: &mut UdpMux<(), ()>, link: LinkHandle, _global: &mut ()) {
    let mut buf = [0u8; 64];
    if let Ok(n) = mux.read(link, &mut buf) {
        let _ = mux.enqueue(link, buf[..n].to_vec());
    }
}

fn no_input(_mux: &mut UdpMux<(), ()>, _link: LinkHandle, _global: &mut ()) {}

fn no_close(_mux: &mut UdpMux<(), ()>, _handle: (), _global: &mut ()) {}

#[test]
fn retransmits_unacked_head_until_retry_budget_then_closes() {
    const TIMEOUT_MS: u64 = 30;
    const MAX_RETRIES: u32 = 3;

    let std_socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = std_socket.local_addr().unwrap();
    std_socket.set_nonblocking(true).unwrap();
    let listener = MioUdpSocket::from_std(std_socket);

    let (ready_tx, ready_rx) = mpsc::channel();
    thread::spawn(move || {
        let mux: UdpMux<(), ()> = UdpMux::new(listener, TIMEOUT_MS, MAX_RETRIES).unwrap();
        let handlers = UdpHandlers {
            open: echo_once,
            input: no_input,
            close: no_close,
        };
        ready_tx.send(()).unwrap();
        mux.run(handlers, &mut ()).unwrap();
    });

    ready_rx.recv().unwrap();

    let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    client.send_to(b"ping", addr).unwrap();

    // The client never acknowledges a reply, so every datagram that arrives
    // is a retransmission of the same unacked head.
    let mut received = Vec::new();
    let last_err = loop {
        let mut buf = [0u8; 64];
        match client.recv_from(&mut buf) {
            Ok((n, _)) => received.push(buf[..n].to_vec()),
            Err(e) => break e,
        }
    };

    assert!(
        matches!(last_err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        "expected the retry loop to stop instead of erroring: {last_err:?}"
    );
    assert_eq!(
        received.len(),
        MAX_RETRIES as usize,
        "expected exactly max_retries identical datagrams, got {received:?}"
    );
    for datagram in &received {
        assert_eq!(datagram, b"ping");
    }
}
