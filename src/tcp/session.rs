//! Core B: regex-framed request/response sessions layered over Core A.
//!
//! Each connection gets a "sliding buffer" of accumulated input; a
//! compiled PCRE2 pattern, anchored and multiline, is applied to it after
//! every readable burst. Every full match becomes exactly one call to the
//! user's request handler with the matched byte range exposed read-only
//! (spec §4.B).

use std::fmt;

use mio::net::TcpListener;
use tracing::debug;

use crate::buf::SlidingBuffer;
use crate::regex_engine::{CompiledRegex, MatchOutcome, RegexError};
use crate::tcp::mux::{ConnHandle, Handlers, MuxError, Multiplexor};

/// A session-scoped reference, opaque to the caller beyond what `scan`,
/// `reply`, and `close` need. Mirrors `tcp::mux::ConnHandle` one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session(ConnHandle);

/// One pending request's capture vector, valid only for the duration of
/// the `request` callback that produced it.
struct CurrentRequest {
    captures: Vec<Option<(usize, usize)>>,
    scanned: bool,
}

struct SessionState<S> {
    buf: SlidingBuffer,
    handle: S,
    current: Option<CurrentRequest>,
}

impl<S: Default> Default for SessionState<S> {
    fn default() -> Self {
        SessionState {
            buf: SlidingBuffer::new(),
            handle: S::default(),
            current: None,
        }
    }
}

/// Growth increment for the sliding buffer on each readable event (spec
/// §4.B: "grow the sliding buffer by at least 2 KiB of capacity").
const READ_GROWTH: usize = 2048;

/// Capability record for the session layer: open/request/close plus a
/// service-wide opaque handle `G`, exactly like `tcp::mux::Handlers` one
/// layer up.
pub struct SessionHandlers<S, G> {
    pub open: Option<fn(&mut SessionService<S, G>, Session, &mut G) -> S>,
    pub request: fn(&mut SessionService<S, G>, Session, &mut G),
    pub close: Option<fn(&mut SessionService<S, G>, S, &mut G)>,
}

struct Ctx<S, G> {
    regex: CompiledRegex,
    handlers: SessionHandlers<S, G>,
    global: G,
}

/// The regex-framed session service. A specialization of `Multiplexor`
/// whose per-connection opaque handle is the sliding buffer plus the
/// user's session handle, and whose global handle bundles the compiled
/// pattern and the user's own global handle.
pub type SessionService<S, G> = Multiplexor<SessionState<S>, Ctx<S, G>>;

#[derive(Debug)]
pub enum SessionError {
    Regex(RegexError),
    Mux(MuxError),
    Io(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Regex(e) => write!(f, "{e}"),
            SessionError::Mux(e) => write!(f, "{e}"),
            SessionError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RegexError> for SessionError {
    fn from(e: RegexError) -> Self {
        SessionError::Regex(e)
    }
}
impl From<MuxError> for SessionError {
    fn from(e: MuxError) -> Self {
        SessionError::Mux(e)
    }
}
impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Set up the TCP multiplexor and per-connection session records, then
/// block running the event loop (spec §4.B, `run_service`). A compile
/// failure in `pattern` is fatal at startup and is reported without ever
/// entering the loop (spec §7, error kind 3).
pub fn run_service<S, G>(
    listener: TcpListener,
    pattern: &[u8],
    handlers: SessionHandlers<S, G>,
    global: G,
) -> Result<(), SessionError>
where
    S: Default,
{
    let regex = CompiledRegex::compile(pattern)?;
    let service: SessionService<S, G> = Multiplexor::new(listener)?;

    let ctx = Ctx {
        regex,
        handlers,
        global,
    };

    let mux_handlers = Handlers {
        open: Some(session_open::<S, G>),
        input: session_input::<S, G>,
        close: Some(session_close::<S, G>),
    };

    let mut ctx = ctx;
    service.run(mux_handlers, &mut ctx).map_err(SessionError::from)
}

fn session_open<S: Default, G>(
    service: &mut SessionService<S, G>,
    conn: ConnHandle,
    ctx: &mut Ctx<S, G>,
) -> SessionState<S> {
    let handle = match ctx.handlers.open {
        Some(open) => open(service, Session(conn), &mut ctx.global),
        None => S::default(),
    };
    SessionState {
        buf: SlidingBuffer::new(),
        handle,
        current: None,
    }
}

fn session_close<S: Default, G>(
    service: &mut SessionService<S, G>,
    state: SessionState<S>,
    ctx: &mut Ctx<S, G>,
) {
    if let Some(close) = ctx.handlers.close {
        close(service, state.handle, &mut ctx.global);
    }
}

/// The outcome of one matching pass over the current buffer contents.
enum PassResult {
    /// A partial match stopped the loop; wait for more input.
    WaitingForMore,
    /// No further complete matches; all consumed input was framed.
    Exhausted,
    /// A definitive non-match (or PCRE2 error): framing is broken.
    Protocol,
}

fn session_input<S: Default, G>(
    service: &mut SessionService<S, G>,
    conn: ConnHandle,
    ctx: &mut Ctx<S, G>,
) {
    let mut tmp = [0u8; READ_GROWTH];
    let n = match service.read(conn, &mut tmp) {
        Ok(n) => n,
        Err(_) => 0,
    };

    if n > 0 {
        if let Some(state) = service.connection_handle_mut(conn) {
            state.buf.reserve(READ_GROWTH);
            state.buf.append(&tmp[..n]);
        }
    }

    let is_eof = service.is_eof(conn);

    let first_pass = run_matches(service, conn, ctx, !is_eof);
    let protocol_error = match first_pass {
        PassResult::Protocol => true,
        PassResult::WaitingForMore | PassResult::Exhausted => {
            if is_eof {
                matches!(
                    run_matches(service, conn, ctx, false),
                    PassResult::Protocol
                )
            } else {
                false
            }
        }
    };

    if protocol_error {
        let _ = service.close(conn);
    }

    if let Some(state) = service.connection_handle_mut(conn) {
        state.buf.reclaim();
    }
}

/// Repeatedly match the compiled regex anchored at the buffer's read
/// cursor, dispatching a request callback for every full match, until a
/// partial match, a definitive non-match, or exhaustion is reached (spec
/// §4.B's framing loop).
fn run_matches<S: Default, G>(
    service: &mut SessionService<S, G>,
    conn: ConnHandle,
    ctx: &mut Ctx<S, G>,
    not_eof: bool,
) -> PassResult {
    loop {
        let state = match service.connection_handle_mut(conn) {
            Some(s) => s,
            None => return PassResult::Exhausted,
        };
        let offset = state.buf.offset();
        let outcome = ctx.regex.match_at(state.buf.as_slice(), offset, not_eof);

        match outcome {
            MatchOutcome::Match { captures } => {
                let match_end = match captures.first().and_then(|c| *c) {
                    Some((_, end)) => end,
                    None => return PassResult::Protocol,
                };

                if let Some(state) = service.connection_handle_mut(conn) {
                    state.buf.advance(match_end - offset);
                    state.current = Some(CurrentRequest {
                        captures,
                        scanned: false,
                    });
                }

                (ctx.handlers.request)(service, Session(conn), &mut ctx.global);

                if let Some(state) = service.connection_handle_mut(conn) {
                    state.current = None;
                } else {
                    return PassResult::Exhausted;
                }
            }
            MatchOutcome::Partial => return PassResult::WaitingForMore,
            MatchOutcome::NoMatch => {
                return if not_eof {
                    PassResult::Protocol
                } else {
                    PassResult::Exhausted
                };
            }
            MatchOutcome::Error(code) => {
                debug!(code, "pcre2 match error, closing session");
                return PassResult::Protocol;
            }
        }
    }
}

impl<S, G> SessionService<S, G>
where
    S: Default,
{
    /// Copy each requested capturing group's bytes into the caller's
    /// buffers (a `None` entry skips that group). Returns the number of
    /// groups that actually participated in the match (a non-participating
    /// group yields a zero-length copy, per spec §4.B). Valid only inside
    /// the `request` callback, at most once per call.
    pub fn scan(&mut self, session: Session, out: &mut [Option<&mut Vec<u8>>]) -> usize {
        let conn = session.0;
        // Snapshot the bytes we need before taking the mutable borrow
        // required to record that the capture vector was consumed — the
        // underlying buffer and the bookkeeping flag live in the same
        // struct, so we read the captures (copy, they're just (usize,
        // usize) pairs) then re-borrow to mark `scanned`.
        let (captures, already_scanned, base_ptr_valid) = match self.connection_handle_mut(conn) {
            Some(state) => {
                let caps = state
                    .current
                    .as_ref()
                    .map(|c| c.captures.clone())
                    .unwrap_or_default();
                let scanned = state.current.as_ref().map(|c| c.scanned).unwrap_or(true);
                (caps, scanned, state.current.is_some())
            }
            None => return 0,
        };

        if already_scanned || !base_ptr_valid {
            return 0;
        }

        let mut present = 0;
        if let Some(state) = self.connection_handle_mut(conn) {
            let subject = state.buf.as_slice();
            for (i, dest) in out.iter_mut().enumerate() {
                let group_idx = i + 1; // group 0 is the whole match
                let range = captures.get(group_idx).copied().flatten();
                if let Some((start, end)) = range {
                    present += 1;
                    if let Some(dest) = dest {
                        dest.clear();
                        dest.extend_from_slice(&subject[start..end]);
                    }
                } else if let Some(dest) = dest {
                    dest.clear();
                }
            }
            if let Some(current) = state.current.as_mut() {
                current.scanned = true;
            }
        }

        present
    }

    /// Enqueue bytes for writing to this session's connection, same
    /// ownership-transfer contract as `tcp::mux::Multiplexor::enqueue_write`.
    /// Callers build the bytes with `format!(...).into_bytes()` in place of
    /// the original library's `printf`-style helper.
    pub fn reply(&mut self, session: Session, data: Vec<u8>) -> Result<(), MuxError> {
        self.enqueue_write(session.0, data)
    }

    /// Equivalent to closing the underlying connection.
    pub fn close_session(&mut self, session: Session) -> Result<(), MuxError> {
        self.close(session.0)
    }

    /// Transient access to the user's per-session opaque handle.
    pub fn session_handle_mut(&mut self, session: Session) -> Option<&mut S> {
        self.connection_handle_mut(session.0).map(|s| &mut s.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_default_has_empty_buffer() {
        let state: SessionState<()> = SessionState::default();
        assert!(state.buf.is_empty());
        assert!(state.current.is_none());
    }
}
