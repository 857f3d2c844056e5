//! Core A: a single-threaded, event-driven TCP session multiplexor.
//!
//! One listening descriptor, N accepted connections, no threads. See
//! spec §4.A for the full contract; this module is a direct translation
//! of that contract onto `mio`, following the teacher's `runtime/mio/
//! event_loop.rs` shape: a `slab::Slab` of connection records keyed by
//! `mio::Token`, one `Poll`, rebuilt interest each iteration.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// A stable reference to one live connection, valid for the duration of a
/// handler invocation (and safe to retain across calls, same as a slab
/// index — the multiplexor will simply report `Err(MuxError::NoSuchConn)`
/// if used after the connection has been destroyed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(usize);

/// One pending write segment: owned bytes, plus how much of them has
/// already gone out on the wire (spec §3(C), "output segment").
struct OutSegment {
    buf: Vec<u8>,
    pos: usize,
}

impl OutSegment {
    fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

struct Connection<H> {
    stream: TcpStream,
    eof: bool,
    output: VecDeque<OutSegment>,
    handle: H,
}

#[derive(Debug)]
pub enum MuxError {
    Io(io::Error),
    NoSuchConn,
}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxError::Io(e) => write!(f, "multiplexor I/O error: {e}"),
            MuxError::NoSuchConn => write!(f, "connection handle no longer valid"),
        }
    }
}

impl std::error::Error for MuxError {}

impl From<io::Error> for MuxError {
    fn from(e: io::Error) -> Self {
        MuxError::Io(e)
    }
}

/// The capability record: three entry points plus an opaque global handle,
/// per spec §9 ("avoids generic virtual dispatch and keeps the hot path
/// direct"). `H` is the per-connection opaque handle; `G` is the
/// service-wide opaque handle threaded through every call.
pub struct Handlers<H, G> {
    /// Invoked once, right after accept. Constructs the per-connection
    /// handle. Optional in spec terms; callers that have no per-connection
    /// state just return `H::default()`.
    pub open: Option<fn(&mut Multiplexor<H, G>, ConnHandle, &mut G) -> H>,
    /// Invoked when a connection has readable data. Must call `read`
    /// exactly once (spec §4.A contract).
    pub input: fn(&mut Multiplexor<H, G>, ConnHandle, &mut G),
    /// Invoked exactly once, as the last callback for a connection.
    pub close: Option<fn(&mut Multiplexor<H, G>, H, &mut G)>,
}

/// The TCP multiplexor itself.
pub struct Multiplexor<H, G> {
    poll: Poll,
    listener: TcpListener,
    accept_broken: bool,
    connections: Slab<Connection<H>>,
}

impl<H: Default, G> Multiplexor<H, G> {
    pub fn new(mut listener: TcpListener) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            accept_broken: false,
            connections: Slab::new(),
        })
    }

    /// Run the event loop. Blocks; returns only once the poll set becomes
    /// empty (accept is broken and every connection has drained and
    /// closed) or an unrecoverable I/O error occurs (spec §4.A).
    pub fn run(mut self, handlers: Handlers<H, G>, global: &mut G) -> Result<(), MuxError> {
        let _sigpipe_guard = ignore_sigpipe();
        let mut events = Events::with_capacity(1024);

        loop {
            self.reap_closed(&handlers, global);

            if self.accept_broken && self.connections.is_empty() {
                debug!("poll set empty, multiplexor run() returning");
                return Ok(());
            }

            self.rebuild_interest()?;

            self.poll.poll(&mut events, None)?;

            // Collect tokens first: handler calls need `&mut self` and
            // `events` borrows `self.poll` only indirectly, but mio's
            // `Events` type is independent, so this is just for clarity.
            let tokens: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                if token == LISTENER_TOKEN {
                    self.accept_connections(&handlers, global);
                    continue;
                }

                let conn_id = token.0;
                if !self.connections.contains(conn_id) {
                    continue;
                }

                if readable {
                    (handlers.input)(&mut self, ConnHandle(conn_id), global);
                }

                if self.connections.contains(conn_id) && writable {
                    self.handle_writable(conn_id);
                }
            }
        }
    }

    fn reap_closed(&mut self, handlers: &Handlers<H, G>, global: &mut G) {
        let dead: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| c.eof && c.output.is_empty())
            .map(|(id, _)| id)
            .collect();

        for id in dead {
            let mut conn = self.connections.remove(id);
            let _ = self.poll.registry().deregister(&mut conn.stream);
            if let Some(close) = handlers.close {
                close(self, conn.handle, global);
            }
            debug!(conn_id = id, "connection closed");
        }
    }

    fn rebuild_interest(&mut self) -> io::Result<()> {
        if !self.accept_broken {
            self.poll
                .registry()
                .reregister(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;
        }

        for (id, conn) in self.connections.iter_mut() {
            let interest = match (!conn.eof, !conn.output.is_empty()) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };
            if let Some(interest) = interest {
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, Token(id), interest)?;
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self, handlers: &Handlers<H, G>, global: &mut G) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = self.connections.insert(Connection {
                        stream,
                        eof: false,
                        output: VecDeque::new(),
                        handle: H::default(),
                    });

                    if let Err(e) = self.poll.registry().register(
                        &mut self.connections[id].stream,
                        Token(id),
                        Interest::READABLE,
                    ) {
                        warn!(error = %e, "failed to register accepted connection");
                        self.connections.remove(id);
                        continue;
                    }

                    debug!(conn_id = id, peer = %peer, "accepted connection");

                    if let Some(open) = handlers.open {
                        let h = open(self, ConnHandle(id), global);
                        if let Some(conn) = self.connections.get_mut(id) {
                            conn.handle = h;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed, no further connections will be accepted");
                    self.accept_broken = true;
                    break;
                }
            }
        }
    }

    fn handle_writable(&mut self, conn_id: usize) {
        loop {
            let conn = match self.connections.get_mut(conn_id) {
                Some(c) => c,
                None => return,
            };
            let seg = match conn.output.front_mut() {
                Some(s) => s,
                None => return,
            };

            match conn.stream.write(seg.remaining()) {
                Ok(0) => {
                    self.destroy_on_error(conn_id);
                    return;
                }
                Ok(n) => {
                    seg.pos += n;
                    if seg.pos >= seg.buf.len() {
                        conn.output.pop_front();
                    }
                    if conn.output.is_empty() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.destroy_on_error(conn_id);
                    return;
                }
            }
        }
    }

    fn destroy_on_error(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.eof = true;
            conn.output.clear();
        }
    }

    /// Transfer ownership of `buf` to the multiplexor; bytes go out in
    /// enqueue order. A zero-length write succeeds and simply drops `buf`.
    pub fn enqueue_write(&mut self, conn: ConnHandle, buf: Vec<u8>) -> Result<(), MuxError> {
        let c = self
            .connections
            .get_mut(conn.0)
            .ok_or(MuxError::NoSuchConn)?;
        if !buf.is_empty() {
            c.output.push_back(OutSegment { buf, pos: 0 });
        }
        Ok(())
    }

    /// Must be called exactly once per input-handler invocation. Returns
    /// `Ok(0)` at EOF (marking the connection for eventual destruction once
    /// output drains) and `Err` on I/O error (same effect).
    pub fn read(&mut self, conn: ConnHandle, out: &mut [u8]) -> Result<usize, MuxError> {
        let c = self
            .connections
            .get_mut(conn.0)
            .ok_or(MuxError::NoSuchConn)?;
        match c.stream.read(out) {
            Ok(0) => {
                c.eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                c.eof = true;
                Err(MuxError::Io(e))
            }
        }
    }

    /// Half-shut the send side and mark EOF; pending writes still drain.
    pub fn close(&mut self, conn: ConnHandle) -> Result<(), MuxError> {
        let c = self
            .connections
            .get_mut(conn.0)
            .ok_or(MuxError::NoSuchConn)?;
        let _ = c.stream.shutdown(Shutdown::Read);
        c.eof = true;
        Ok(())
    }

    /// Whether this connection has seen EOF (peer half-close, error, or a
    /// local `close`). Used by the regex-framing layer (spec §4.B) to
    /// decide when to run its final, non-partial matching pass.
    pub fn is_eof(&self, conn: ConnHandle) -> bool {
        self.connections.get(conn.0).map(|c| c.eof).unwrap_or(true)
    }

    /// Transient access to the per-connection opaque handle. Layers built
    /// on top of the multiplexor (e.g. the regex-framed session layer)
    /// use this instead of having it threaded through every callback, to
    /// avoid two live `&mut` borrows of the same multiplexor.
    pub fn connection_handle_mut(&mut self, conn: ConnHandle) -> Option<&mut H> {
        self.connections.get_mut(conn.0).map(|c| &mut c.handle)
    }
}

/// Block SIGPIPE for the duration of the event loop and restore the prior
/// disposition on every exit path (spec §5: "scoped acquisition of the
/// signal disposition with guaranteed release on all exit paths"). Guarded
/// by a drop type so panics unwinding out of `run` still restore it.
struct SigpipeGuard {
    previous: libc::sighandler_t,
}

fn ignore_sigpipe() -> SigpipeGuard {
    let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    SigpipeGuard { previous }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::signal(libc::SIGPIPE, self.previous);
        }
    }
}
