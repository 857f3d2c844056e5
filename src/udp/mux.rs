//! Spec's Core B: a session-ful UDP server with per-packet retransmission.
//!
//! A "link" begins life the moment a datagram arrives at the shared
//! listening socket; the first `read` on it resolves the peer address and
//! hands the link a freshly connected private socket (so the kernel
//! assigns a session-identifying port, TFTP-style). Every queued outbound
//! packet carries its own retry budget (spec §4.C).

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(usize);

/// One queued outbound datagram with its retry bookkeeping (spec §3(D)).
struct UdpSegment {
    buf: Vec<u8>,
    /// Transmissions performed so far, including the first.
    attempts: u32,
    /// Poll cycles elapsed with no inbound traffic since the last send.
    timeouts: u32,
}

enum LinkSock {
    /// Not yet initialized: reads/writes go through the shared listener.
    Shared,
    Private(UdpSocket),
}

struct Link<L> {
    peer: Option<SocketAddr>,
    sock: LinkSock,
    initialized: bool,
    closed: bool,
    output: VecDeque<UdpSegment>,
    handle: Option<L>,
}

#[derive(Debug)]
pub enum UdpMuxError {
    Io(io::Error),
    NoSuchLink,
}

impl std::fmt::Display for UdpMuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UdpMuxError::Io(e) => write!(f, "udp multiplexor I/O error: {e}"),
            UdpMuxError::NoSuchLink => write!(f, "link handle no longer valid"),
        }
    }
}

impl std::error::Error for UdpMuxError {}

impl From<io::Error> for UdpMuxError {
    fn from(e: io::Error) -> Self {
        UdpMuxError::Io(e)
    }
}

pub struct UdpHandlers<L, G> {
    /// Invoked once a new peer's first datagram is signalled. Must call
    /// `read` exactly once (spec §4.C: "the open handler... must read the
    /// first datagram").
    pub open: fn(&mut UdpMux<L, G>, LinkHandle, &mut G) -> L,
    /// Invoked on subsequent datagrams. Must call `read` exactly once.
    pub input: fn(&mut UdpMux<L, G>, LinkHandle, &mut G),
    /// Invoked exactly once when a link is torn down (retry budget
    /// exhausted, or closed and drained).
    pub close: fn(&mut UdpMux<L, G>, L, &mut G),
}

pub struct UdpMux<L, G> {
    poll: Poll,
    listener: UdpSocket,
    links: Slab<Link<L>>,
    timeout: Duration,
    max_retries: u32,
}

impl<L, G> UdpMux<L, G> {
    pub fn new(mut listener: UdpSocket, timeout_ms: u64, max_retries: u32) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            links: Slab::new(),
            timeout: Duration::from_millis(timeout_ms),
            max_retries,
        })
    }

    pub fn run(mut self, handlers: UdpHandlers<L, G>, global: &mut G) -> Result<(), UdpMuxError> {
        let mut events = Events::with_capacity(1024);

        loop {
            self.garbage_collect(&handlers, global);
            self.rebuild_interest()?;

            let poll_timeout = if self.any_outstanding_head() {
                Some(self.timeout)
            } else {
                None
            };

            self.poll.poll(&mut events, poll_timeout)?;

            if events.is_empty() {
                self.rearm_timed_out_heads();
                continue;
            }

            let tokens: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                if token == LISTENER_TOKEN {
                    if readable {
                        self.accept_new_link(&handlers, global);
                    }
                    continue;
                }

                let id = token.0;
                if !self.links.contains(id) {
                    continue;
                }

                if readable {
                    self.handle_readable(id, &handlers, global);
                }

                if self.links.contains(id) && writable {
                    self.handle_writable(id);
                }
            }
        }
    }

    fn any_outstanding_head(&self) -> bool {
        self.links
            .iter()
            .any(|(_, l)| l.output.front().map(|h| h.attempts > 0).unwrap_or(false))
    }

    fn rearm_timed_out_heads(&mut self) {
        for (_, link) in self.links.iter_mut() {
            if link.closed {
                continue;
            }
            if let Some(head) = link.output.front_mut() {
                if head.timeouts < head.attempts {
                    head.timeouts += 1;
                }
            }
        }
    }

    /// GC step (spec §4.C, retry algorithm step 1).
    fn garbage_collect(&mut self, handlers: &UdpHandlers<L, G>, global: &mut G) {
        let mut to_close = Vec::new();
        for (id, link) in self.links.iter_mut() {
            if let Some(head) = link.output.front() {
                if head.attempts >= self.max_retries {
                    debug!(link = id, "retry budget exhausted, closing link");
                    link.output.clear();
                    link.closed = true;
                } else if link.closed && head.attempts > 0 {
                    link.output.pop_front();
                }
            }
            if link.closed && link.output.is_empty() {
                to_close.push(id);
            }
        }

        for id in to_close {
            let mut link = self.links.remove(id);
            if let LinkSock::Private(ref mut sock) = link.sock {
                let _ = self.poll.registry().deregister(sock);
            }
            if let Some(handle) = link.handle.take() {
                (handlers.close)(self, handle, global);
            }
        }
    }

    fn rebuild_interest(&mut self) -> io::Result<()> {
        for (id, link) in self.links.iter_mut() {
            let sock = match &mut link.sock {
                LinkSock::Private(s) => s,
                LinkSock::Shared => continue,
            };

            let want_read = !link.closed;
            let want_write = link
                .output
                .front()
                .map(|h| h.timeouts == h.attempts)
                .unwrap_or(false);

            let interest = match (want_read, want_write) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };

            if let Some(interest) = interest {
                self.poll.registry().reregister(sock, Token(id), interest)?;
            }
        }
        Ok(())
    }

    fn accept_new_link(&mut self, handlers: &UdpHandlers<L, G>, global: &mut G) {
        let id = self.links.insert(Link {
            peer: None,
            sock: LinkSock::Shared,
            initialized: false,
            closed: false,
            output: VecDeque::new(),
            handle: None,
        });

        let handle = (handlers.open)(self, LinkHandle(id), global);
        if let Some(link) = self.links.get_mut(id) {
            link.handle = Some(handle);
        }
    }

    fn handle_readable(&mut self, id: usize, handlers: &UdpHandlers<L, G>, global: &mut G) {
        let is_ack = self
            .links
            .get(id)
            .and_then(|l| l.output.front())
            .map(|h| h.attempts > 0)
            .unwrap_or(false);

        if is_ack {
            if let Some(link) = self.links.get_mut(id) {
                link.output.pop_front();
            }
        }

        (handlers.input)(self, LinkHandle(id), global);
    }

    fn handle_writable(&mut self, id: usize) {
        let link = match self.links.get_mut(id) {
            Some(l) => l,
            None => return,
        };

        let peer = match link.peer {
            Some(p) => p,
            None => return,
        };

        let send_result = {
            let head = match link.output.front() {
                Some(h) => h,
                None => return,
            };
            match &link.sock {
                LinkSock::Private(sock) => sock.send(&head.buf),
                LinkSock::Shared => self.listener.send_to(&head.buf, peer),
            }
        };

        match send_result {
            Ok(_) => {
                if link.output.len() > 1 {
                    link.output.pop_front();
                } else if let Some(head) = link.output.front_mut() {
                    head.attempts += 1;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(link = id, error = %e, "udp send failed");
            }
        }
    }

    /// Transfer ownership of `buf`; queued FIFO, only the head is eligible
    /// for (re)transmission.
    pub fn enqueue(&mut self, link: LinkHandle, buf: Vec<u8>) -> Result<(), UdpMuxError> {
        let l = self
            .links
            .get_mut(link.0)
            .ok_or(UdpMuxError::NoSuchLink)?;
        l.output.push_back(UdpSegment {
            buf,
            attempts: 0,
            timeouts: 0,
        });
        Ok(())
    }

    /// On the first call per link, receives via the shared listening
    /// socket, captures the peer address, and creates+connects a fresh
    /// private socket; on subsequent calls, reads from that socket. An
    /// error closes the link (spec §4.C).
    pub fn read(&mut self, link: LinkHandle, out: &mut [u8]) -> Result<usize, UdpMuxError> {
        let result = self.read_inner(link, out);
        if result.is_err() {
            if let Some(l) = self.links.get_mut(link.0) {
                l.closed = true;
            }
        }
        result
    }

    fn read_inner(&mut self, link: LinkHandle, out: &mut [u8]) -> Result<usize, UdpMuxError> {
        let initialized = self
            .links
            .get(link.0)
            .map(|l| l.initialized)
            .ok_or(UdpMuxError::NoSuchLink)?;

        if !initialized {
            let (n, peer) = self.listener.recv_from(out)?;

            let any: SocketAddr = if peer.is_ipv6() {
                "[::]:0".parse().unwrap()
            } else {
                "0.0.0.0:0".parse().unwrap()
            };
            let mut private = UdpSocket::bind(any)?;
            private.connect(peer)?;
            self.poll
                .registry()
                .register(&mut private, Token(link.0), Interest::READABLE)?;

            let l = self.links.get_mut(link.0).ok_or(UdpMuxError::NoSuchLink)?;
            l.peer = Some(peer);
            l.sock = LinkSock::Private(private);
            l.initialized = true;

            debug!(link = link.0, peer = %peer, "udp link initialized");
            Ok(n)
        } else {
            let l = self.links.get_mut(link.0).ok_or(UdpMuxError::NoSuchLink)?;
            match &l.sock {
                LinkSock::Private(sock) => Ok(sock.recv(out)?),
                LinkSock::Shared => unreachable!("initialized link always has a private socket"),
            }
        }
    }

    /// Stop accepting input; pending outbound packets still attempt to
    /// send but are not retransmitted.
    pub fn close(&mut self, link: LinkHandle) -> Result<(), UdpMuxError> {
        let l = self
            .links
            .get_mut(link.0)
            .ok_or(UdpMuxError::NoSuchLink)?;
        l.closed = true;
        Ok(())
    }

    pub fn link_handle_mut(&mut self, link: LinkHandle) -> Option<&mut L> {
        self.links.get_mut(link.0).and_then(|l| l.handle.as_mut())
    }

    pub fn peer_addr(&self, link: LinkHandle) -> Option<SocketAddr> {
        self.links.get(link.0).and_then(|l| l.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_retry_bookkeeping_defaults() {
        let seg = UdpSegment {
            buf: vec![1, 2, 3],
            attempts: 0,
            timeouts: 0,
        };
        assert_eq!(seg.attempts, 0);
        assert_eq!(seg.timeouts, 0);
    }
}
