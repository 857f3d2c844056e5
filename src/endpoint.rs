//! Endpoint resolution: `host[:port]` or a filesystem path to one or more
//! bindable socket descriptors (spec §6, "Endpoint syntax").

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::net::SocketAddr as UnixSocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// A resolved bind/connect target: either a chain of TCP/UDP socket
/// addresses (the host may resolve to several, e.g. both an IPv4 and an
/// IPv6 address) or a single filesystem socket path.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Inet(Vec<SocketAddr>),
    Unix(std::path::PathBuf),
}

#[derive(Debug)]
pub enum EndpointError {
    Resolve(String, std::io::Error),
    Empty(String),
    PathTooLong(std::path::PathBuf),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::Resolve(spec, e) => {
                write!(f, "failed to resolve endpoint '{spec}': {e}")
            }
            EndpointError::Empty(spec) => {
                write!(f, "endpoint '{spec}' resolved to no addresses")
            }
            EndpointError::PathTooLong(p) => {
                write!(f, "unix socket path too long: {}", p.display())
            }
        }
    }
}

impl std::error::Error for EndpointError {}

/// Maximum path length storable in a `sockaddr_un.sun_path` on Linux/macOS.
const UNIX_PATH_MAX: usize = 104;

impl Endpoint {
    /// Parse `spec` per spec §6: a leading `/` or `.` denotes a filesystem
    /// socket path; otherwise `spec` is `host[:port]`, falling back to
    /// `default_port` when no port is given.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self, EndpointError> {
        if spec.starts_with('/') || spec.starts_with('.') {
            let path = std::path::PathBuf::from(spec);
            if path.as_os_str().len() >= UNIX_PATH_MAX {
                return Err(EndpointError::PathTooLong(path));
            }
            return Ok(Endpoint::Unix(path));
        }

        let host_port = split_host_port(spec, default_port);
        let addrs: Vec<SocketAddr> = host_port
            .to_socket_addrs()
            .map_err(|e| EndpointError::Resolve(spec.to_string(), e))?
            .collect();

        if addrs.is_empty() {
            return Err(EndpointError::Empty(spec.to_string()));
        }

        Ok(Endpoint::Inet(addrs))
    }

    /// The first resolved address, for callers that only need one bind
    /// target (the multiplexors bind exactly once).
    pub fn primary(&self) -> EndpointAddr<'_> {
        match self {
            Endpoint::Inet(addrs) => EndpointAddr::Inet(addrs[0]),
            Endpoint::Unix(path) => EndpointAddr::Unix(path),
        }
    }
}

pub enum EndpointAddr<'a> {
    Inet(SocketAddr),
    Unix(&'a std::path::Path),
}

impl fmt::Display for EndpointAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddr::Inet(a) => write!(f, "{a}"),
            EndpointAddr::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Convert a `host[:port]` textual endpoint into an owned `host:port` string
/// so it can be handed to `ToSocketAddrs`, honoring a bracketed IPv6 literal.
fn split_host_port(spec: &str, default_port: u16) -> String {
    if spec.starts_with('[') {
        // Bracketed IPv6 literal: `[::1]` or `[::1]:8080`.
        if let Some(close) = spec.find(']') {
            let rest = &spec[close + 1..];
            return if let Some(port) = rest.strip_prefix(':') {
                format!("[{}]:{}", &spec[1..close], port)
            } else {
                format!("[{}]:{}", &spec[1..close], default_port)
            };
        }
    }

    match spec.rsplit_once(':') {
        // Only treat this as host:port if the suffix after the colon is a
        // valid port number; otherwise it was a bare IPv6 literal such as
        // "::1" with no brackets, which we do not attempt to disambiguate
        // further (out of scope per spec §1).
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            format!("{host}:{port}")
        }
        _ => format!("{spec}:{default_port}"),
    }
}

/// Bind a listening TCP socket with `SO_REUSEADDR` set before `listen(2)`,
/// so a restarted service doesn't have to wait out `TIME_WAIT` on the old
/// socket (spec §6: resolve a text endpoint spec "to one or more bindable
/// socket descriptors"). Mirrors the teacher's own `socket2`-based listener
/// setup in `runtime/mio/event_loop.rs`, minus `SO_REUSEPORT` since this
/// library binds exactly once rather than load-balancing across workers.
pub fn bind_tcp_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Bind a UDP socket with `SO_REUSEADDR` set, same rationale as
/// `bind_tcp_listener`.
pub fn bind_udp_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Render a socket address the way a log line or status endpoint wants it
/// (spec §6, "includes a printer").
pub fn print_addr(addr: &SocketAddr) -> String {
    addr.to_string()
}

pub fn print_unix(addr: &UnixSocketAddr) -> String {
    addr.as_pathname()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<unnamed unix socket>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let ep = Endpoint::parse("127.0.0.1:9000", 80).unwrap();
        match ep {
            Endpoint::Inet(addrs) => assert_eq!(addrs[0].port(), 9000),
            _ => panic!("expected inet endpoint"),
        }
    }

    #[test]
    fn defaults_port_when_absent() {
        let ep = Endpoint::parse("127.0.0.1", 1234).unwrap();
        match ep {
            Endpoint::Inet(addrs) => assert_eq!(addrs[0].port(), 1234),
            _ => panic!("expected inet endpoint"),
        }
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let ep = Endpoint::parse("[::1]:7000", 80).unwrap();
        match ep {
            Endpoint::Inet(addrs) => {
                assert_eq!(addrs[0].port(), 7000);
                assert!(addrs[0].is_ipv6());
            }
            _ => panic!("expected inet endpoint"),
        }
    }

    #[test]
    fn parses_filesystem_path() {
        let ep = Endpoint::parse("/tmp/my.sock", 80).unwrap();
        assert!(matches!(ep, Endpoint::Unix(_)));
        let ep = Endpoint::parse("./relative.sock", 80).unwrap();
        assert!(matches!(ep, Endpoint::Unix(_)));
    }
}
