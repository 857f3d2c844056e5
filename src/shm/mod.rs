//! Cross-process shared-memory communication domain: N participants, one
//! ring-buffered mailbox each, a barrier, and cooperative shutdown (spec
//! §4.D).

mod condvar;
mod header;
mod mutex;
mod ring;

pub mod domain;
pub mod launcher;

pub use domain::{DomainHandle, ShmError};
pub use mutex::SignalMask;
