//! Example binary exercising Core C: a retransmitting, session-ful UDP
//! server that echoes each datagram back to its sender (spec §8, scenario
//! 4 — loss of the first reply triggers a retransmission once the
//! configured timeout elapses).

use std::net::SocketAddr;

use mio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use posix_sessions::config::Config;
use posix_sessions::endpoint::{bind_udp_socket, Endpoint, EndpointAddr};
use posix_sessions::udp::mux::{LinkHandle, UdpHandlers, UdpMux};

fn open(mux: &mut UdpMux<(), ()>, link: LinkHandle, global: &mut ()) -> () {
    input(mux, link, global)
}

fn input(mux: &mut UdpMux<(), ()>, link: LinkHandle, _global: &mut ()) {
    let mut buf = [0u8; 2048];
    match mux.read(link, &mut buf) {
        Ok(n) => {
            let _ = mux.enqueue(link, buf[..n].to_vec());
        }
        Err(e) => {
            tracing::debug!(error = %e, "udp read failed");
        }
    }
}

fn close(_mux: &mut UdpMux<(), ()>, _handle: (), _global: &mut ()) {}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let endpoint = Endpoint::parse(&config.listen, 7001)?;
    let addr: SocketAddr = match endpoint.primary() {
        EndpointAddr::Inet(addr) => addr,
        EndpointAddr::Unix(_) => {
            return Err("filesystem-socket endpoints are not supported by this example binary".into())
        }
    };

    let listener = UdpSocket::from_std(bind_udp_socket(addr)?);
    tracing::info!(
        listen = %addr,
        timeout_ms = config.udp_timeout_ms,
        max_retries = config.udp_max_retries,
        "starting udp echo server"
    );

    let mux: UdpMux<(), ()> = UdpMux::new(listener, config.udp_timeout_ms, config.udp_max_retries)?;

    let handlers = UdpHandlers { open, input, close };

    mux.run(handlers, &mut ())?;
    Ok(())
}
