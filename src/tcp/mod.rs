//! Core A (TCP multiplexor) and Core B (regex-framed session layer).

pub mod mux;
pub mod session;

pub use mux::{ConnHandle, Handlers, Multiplexor, MuxError};
pub use session::{Session, SessionHandlers, SessionService};
