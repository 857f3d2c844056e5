//! Session-ful UDP with per-packet retransmission (spec §4.C).

pub mod mux;

pub use mux::{LinkHandle, UdpHandlers, UdpMux, UdpMuxError};
