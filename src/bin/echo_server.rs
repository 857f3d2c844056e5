//! Example binary exercising Core A/B: a TCP server that frames requests
//! with a regex and echoes the first capture group back, newline
//! terminated (spec §8, scenarios 1-3).

use std::net::SocketAddr;

use mio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use posix_sessions::config::Config;
use posix_sessions::endpoint::{bind_tcp_listener, Endpoint, EndpointAddr};
use posix_sessions::tcp::session::{run_service, Session, SessionHandlers};

fn request(service: &mut posix_sessions::tcp::session::SessionService<(), ()>, session: Session, _global: &mut ()) {
    let mut captured = Vec::new();
    service.scan(session, &mut [Some(&mut captured)]);
    captured.push(b'\n');
    let _ = service.reply(session, captured);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let endpoint = Endpoint::parse(&config.listen, 7000)?;
    let addr: SocketAddr = match endpoint.primary() {
        EndpointAddr::Inet(addr) => addr,
        EndpointAddr::Unix(_) => {
            return Err("filesystem-socket endpoints are not supported by this example binary".into())
        }
    };

    let listener = TcpListener::from_std(bind_tcp_listener(addr, 1024)?);
    tracing::info!(listen = %addr, pattern = %config.pattern, "starting echo server");

    let handlers = SessionHandlers {
        open: None,
        request,
        close: None,
    };

    run_service(listener, config.pattern.as_bytes(), handlers, ())?;
    Ok(())
}
