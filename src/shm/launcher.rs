//! Launcher/worker bootstrap via environment variables, and launcher-side
//! propagation of worker exit status to the whole process group (spec §6
//! "Launcher-worker environment", §7 "Exit codes from launched workers").
//!
//! Supplements `spec.md`'s explicit exclusion of the generic environment-
//! variable plumbing helper: that exclusion covers the trivial key/value
//! transliteration, not the launcher's bootstrap and supervision semantics,
//! which scenarios 5 and 6 of spec §8 depend on.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum LauncherError {
    MissingName,
    MissingRank,
    InvalidRank,
    WorkerFailed { index: usize },
}

impl std::fmt::Display for LauncherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LauncherError::MissingName => write!(f, "missing <prefix>_NAME environment variable"),
            LauncherError::MissingRank => write!(f, "missing <prefix>_RANK environment variable"),
            LauncherError::InvalidRank => write!(f, "<prefix>_RANK is not a valid rank"),
            LauncherError::WorkerFailed { index } => write!(f, "worker {index} exited with failure"),
        }
    }
}

impl std::error::Error for LauncherError {}

fn name_var(prefix: &str) -> String {
    format!("{prefix}_NAME")
}

fn rank_var(prefix: &str) -> String {
    format!("{prefix}_RANK")
}

/// Worker side: recover the backing file path and this process's rank from
/// the environment a launcher set before spawning it.
pub fn bootstrap_from_env(prefix: &str) -> Result<(PathBuf, u32), LauncherError> {
    let name = env::var_os(name_var(prefix)).ok_or(LauncherError::MissingName)?;
    let rank = env::var(rank_var(prefix)).map_err(|_| LauncherError::MissingRank)?;
    let rank: u32 = rank.parse().map_err(|_| LauncherError::InvalidRank)?;
    Ok((PathBuf::from(name), rank))
}

/// Launcher side: spawn `count` copies of `binary`, each carrying
/// `<prefix>_NAME`/`<prefix>_RANK` so it can `bootstrap_from_env` and
/// `DomainHandle::connect`. Ranks run from `start_rank` (inclusive) so a
/// launcher that is itself a participant at rank 0 can spawn the remaining
/// `count` participants starting at rank 1.
pub fn spawn_workers(
    prefix: &str,
    binary: impl AsRef<OsStr>,
    backing_file: &Path,
    start_rank: u32,
    count: u32,
    extra_args: &[String],
) -> std::io::Result<Vec<Child>> {
    let mut children = Vec::with_capacity(count as usize);
    for rank in start_rank..start_rank + count {
        let child = Command::new(binary.as_ref())
            .args(extra_args)
            .env(name_var(prefix), backing_file)
            .env(rank_var(prefix), rank.to_string())
            .spawn()?;
        info!(rank, pid = child.id(), "spawned worker");
        children.push(child);
    }
    Ok(children)
}

/// Poll every worker to completion. On the first non-zero exit or wait
/// failure, send `SIGTERM` to the whole process group and kill the rest
/// (spec §7: "any non-zero exit or signal causes the launcher to send a
/// termination signal to the whole process group and return failure").
pub fn supervise(mut children: Vec<Child>) -> Result<(), LauncherError> {
    let mut exited = vec![false; children.len()];
    let mut failure = None;

    'poll: loop {
        for (index, child) in children.iter_mut().enumerate() {
            if exited[index] {
                continue;
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    exited[index] = true;
                    if !status.success() {
                        warn!(index, ?status, "worker exited with failure");
                        failure = Some(index);
                        break 'poll;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    exited[index] = true;
                    error!(index, error = %e, "failed to poll worker");
                    failure = Some(index);
                    break 'poll;
                }
            }
        }

        if exited.iter().all(|&done| done) {
            break 'poll;
        }

        std::thread::sleep(Duration::from_millis(20));
    }

    if let Some(index) = failure {
        if let Err(e) = signal::kill(Pid::from_raw(0), Signal::SIGTERM) {
            error!(error = %e, "failed to signal process group after worker failure");
        }
        for child in children.iter_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        return Err(LauncherError::WorkerFailed { index });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_requires_both_env_vars() {
        env::remove_var("TEST_PFX_NAME");
        env::remove_var("TEST_PFX_RANK");
        assert!(matches!(
            bootstrap_from_env("TEST_PFX"),
            Err(LauncherError::MissingName)
        ));
    }

    #[test]
    fn bootstrap_round_trips_through_env() {
        env::set_var("TEST_PFX2_NAME", "/tmp/whatever");
        env::set_var("TEST_PFX2_RANK", "3");
        let (path, rank) = bootstrap_from_env("TEST_PFX2").expect("bootstrap");
        assert_eq!(path, PathBuf::from("/tmp/whatever"));
        assert_eq!(rank, 3);
        env::remove_var("TEST_PFX2_NAME");
        env::remove_var("TEST_PFX2_RANK");
    }
}
