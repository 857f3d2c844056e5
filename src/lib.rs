//! `posix-sessions`: a single-threaded, event-driven TCP session
//! multiplexor with regex-framed request parsing; a retransmitting,
//! session-oriented UDP server; and a cross-process shared-memory
//! communication domain with ring-buffered mailboxes, a barrier, and
//! cooperative shutdown.
//!
//! The three cores are independent at runtime and share only the
//! [`buf::SlidingBuffer`] and [`endpoint::Endpoint`] building blocks.

pub mod buf;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod regex_engine;
pub mod shm;
pub mod tcp;
pub mod udp;

pub use error::Error;
