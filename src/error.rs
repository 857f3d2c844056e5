//! Crate-wide error aggregate, for callers (chiefly the example binaries)
//! that want one error type across all three cores (spec §7's five error
//! kinds, unified).

use std::fmt;

use crate::endpoint::EndpointError;
use crate::regex_engine::RegexError;
use crate::shm::ShmError;
use crate::tcp::mux::MuxError;
use crate::tcp::session::SessionError;
use crate::udp::mux::UdpMuxError;

#[derive(Debug)]
pub enum Error {
    Endpoint(EndpointError),
    Regex(RegexError),
    Tcp(MuxError),
    Session(SessionError),
    Udp(UdpMuxError),
    Shm(ShmError),
    Config(crate::config::ConfigError),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Endpoint(e) => write!(f, "{e}"),
            Error::Regex(e) => write!(f, "{e}"),
            Error::Tcp(e) => write!(f, "{e}"),
            Error::Session(e) => write!(f, "{e}"),
            Error::Udp(e) => write!(f, "{e}"),
            Error::Shm(e) => write!(f, "{e}"),
            Error::Config(e) => write!(f, "{e}"),
            Error::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<EndpointError> for Error {
    fn from(e: EndpointError) -> Self {
        Error::Endpoint(e)
    }
}
impl From<RegexError> for Error {
    fn from(e: RegexError) -> Self {
        Error::Regex(e)
    }
}
impl From<MuxError> for Error {
    fn from(e: MuxError) -> Self {
        Error::Tcp(e)
    }
}
impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Session(e)
    }
}
impl From<UdpMuxError> for Error {
    fn from(e: UdpMuxError) -> Self {
        Error::Udp(e)
    }
}
impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}
impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Error::Config(e)
    }
}
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
