//! Environment probes and naming helpers for integration suites.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Environment variable that forces docker-backed suites to skip.
pub const SKIP_DOCKER_ENV: &str = "PGFILE_SKIP_DOCKER";

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

static SCRATCH_COUNTER: AtomicU32 = AtomicU32::new(0);

/// How a docker daemon was (or was not) located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerProbe {
    /// Suites were told to skip via [`SKIP_DOCKER_ENV`].
    Skipped,
    /// A unix socket exists at the given path.
    Socket(PathBuf),
    /// `DOCKER_HOST` names a non-socket endpoint; assumed reachable.
    Remote(String),
    /// `docker info` succeeded.
    Cli,
    /// Nothing usable was found.
    Missing,
}

impl DockerProbe {
    /// Whether container-backed tests should run.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Socket(_) | Self::Remote(_) | Self::Cli)
    }
}

/// Returns `true` if a Docker daemon is reachable for integration tests.
#[must_use]
pub fn docker_available() -> bool {
    probe_docker().is_available()
}

/// Locate a docker daemon using the process environment.
#[must_use]
pub fn probe_docker() -> DockerProbe {
    probe_with(
        std::env::var_os(SKIP_DOCKER_ENV).is_some(),
        std::env::var("DOCKER_HOST").ok(),
        docker_cli_responds,
    )
}

fn probe_with(skip: bool, host: Option<String>, cli: impl FnOnce() -> bool) -> DockerProbe {
    if skip {
        return DockerProbe::Skipped;
    }
    match host {
        Some(host) => match host.strip_prefix("unix://") {
            Some(path) if Path::new(path).exists() => DockerProbe::Socket(PathBuf::from(path)),
            Some(_) => DockerProbe::Missing,
            None => DockerProbe::Remote(host),
        },
        None if Path::new(DEFAULT_SOCKET).exists() => {
            DockerProbe::Socket(PathBuf::from(DEFAULT_SOCKET))
        }
        None if cli() => DockerProbe::Cli,
        None => DockerProbe::Missing,
    }
}

fn docker_cli_responds() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .is_ok_and(|output| output.status.success())
}

/// Produce a process-unique identifier usable as a channel or schema name.
#[must_use]
pub fn scratch_name(prefix: &str) -> String {
    let seq = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{seq}", std::process::id())
}
