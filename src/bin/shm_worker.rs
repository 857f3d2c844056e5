//! Example binary exercising Core C's launcher/worker lifecycle: rank 0
//! creates the shared domain and spawns the remaining participants as
//! copies of this same binary; every participant rendezvouses at a
//! barrier, exchanges one message with its neighbor, then rank 0 shuts the
//! domain down (spec §8, scenarios 5 and 6).

use tracing_subscriber::EnvFilter;

use posix_sessions::config::Config;
use posix_sessions::shm::domain::DomainHandle;
use posix_sessions::shm::launcher;

const ENV_PREFIX: &str = "POSIX_SESSIONS_SHM";

/// `DomainHandle::read` blocks until its caller-supplied buffer is filled
/// completely (spec §4.D: atomic multi-byte receive), so the neighbor
/// exchange below frames every message to this exact width instead of
/// a length the reader would have to guess.
const MESSAGE_WIDTH: usize = 32;

/// Pad `text` with trailing zero bytes to `MESSAGE_WIDTH`, truncating if it
/// doesn't fit (it always does for the greeting this binary sends).
fn frame_message(text: &str) -> [u8; MESSAGE_WIDTH] {
    let mut framed = [0u8; MESSAGE_WIDTH];
    let bytes = text.as_bytes();
    let n = bytes.len().min(MESSAGE_WIDTH);
    framed[..n].copy_from_slice(&bytes[..n]);
    framed
}

fn run_participant(mut domain: DomainHandle) -> Result<(), Box<dyn std::error::Error>> {
    let rank = domain.rank();
    let count = domain.participant_count();

    tracing::info!(rank, count, "participant entering barrier");
    if !domain.barrier()? {
        tracing::warn!(rank, "domain shut down before barrier completed");
        return Ok(());
    }

    let neighbor = (rank + 1) % count;
    let message = frame_message(&format!("hello from {rank}"));
    domain.write(neighbor, &message)?;

    let mut buf = [0u8; MESSAGE_WIDTH];
    let n = domain.read(&mut buf)?;
    if n > 0 {
        let text = String::from_utf8_lossy(&buf);
        tracing::info!(rank, received = %text.trim_end_matches('\0'), "message received");
    }

    domain.barrier()?;

    if rank == 0 {
        domain.shutdown()?;
        domain.free()?;
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match launcher::bootstrap_from_env(ENV_PREFIX) {
        Ok((path, rank)) => {
            let domain = DomainHandle::connect(&path, rank, None)?;
            run_participant(domain)
        }
        Err(_) => {
            let participants = config.shm_participants.max(1);
            let buffer_size = config.shm_buffer_size;

            let domain = DomainHandle::setup(buffer_size, participants, 0, None)?;
            tracing::info!(participants, buffer_size, "shared domain created by launcher");

            let this_binary = std::env::current_exe()?;
            let children = launcher::spawn_workers(
                ENV_PREFIX,
                &this_binary,
                domain.path(),
                1,
                participants - 1,
                &[],
            )?;

            let creator_result = run_participant(domain);
            launcher::supervise(children)?;
            creator_result
        }
    }
}
