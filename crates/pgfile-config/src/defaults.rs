//! Built-in configuration values.
//!
//! # Design
//! - Mirror the cadences the engine was tuned for (30s channel probe, 5s
//!   authorization refresh).
//! - Keep every default in one place so the loader and tests agree.

/// Section name holding the engine's enable flag.
pub const MODULE_SECTION: &str = "pg-file";
/// Notification channel the engine subscribes to.
pub(crate) const CHANNEL: &str = "file";
/// Pool size for query batches and completion directives.
pub(crate) const MAX_CONNECTIONS: u32 = 4;
/// Root directory files are materialised under.
pub(crate) const FILES_ROOT: &str = "/var/lib/pgfile/files";
/// Mode for created directories.
pub(crate) const DIR_MODE: &str = "0755";
/// Mode for written files.
pub(crate) const FILE_MODE: &str = "0644";
/// Timeout applied to remote fetches.
pub(crate) const FETCH_TIMEOUT_SECS: u64 = 60;
/// Binary used by the `curl` transport.
pub(crate) const CURL_BINARY: &str = "curl";
/// Heartbeat cadence.
pub(crate) const TICK_MILLIS: u64 = 1_000;
/// Channel health-check cadence.
pub(crate) const LISTEN_CHECK_SECS: u64 = 30;
/// Authorization refresh cadence.
pub(crate) const AUTH_REFRESH_SECS: u64 = 5;
/// Session lifetime before a proactive re-login.
pub(crate) const SESSION_MAX_AGE_SECS: u64 = 300;
/// Age after which an unfinished handler is reaped.
pub(crate) const HANDLER_TIMEOUT_SECS: u64 = 60;
/// Upper bound on concurrently dispatched operations.
pub(crate) const MAX_IN_FLIGHT: usize = 16;
/// Default log level.
pub(crate) const LOG_LEVEL: &str = "info";
