//! Configuration sections for the pgfile daemon.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::ConfigResult;
use crate::validate::parse_octal_mode;

/// Complete configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Store connection settings.
    pub database: DatabaseConfig,
    /// Credentials used to obtain the authorization session.
    pub auth: AuthConfig,
    /// Filesystem target and remote fetch settings.
    pub files: FilesConfig,
    /// Heartbeat cadences and handler limits.
    pub heartbeat: HeartbeatConfig,
    /// Per-module enable flags keyed by section name.
    pub modules: BTreeMap<String, ModuleSection>,
    /// Logging output settings.
    pub logging: LoggingSection,
}

impl SyncConfig {
    /// Whether the module stored under `section` is enabled. Missing sections are enabled.
    #[must_use]
    pub fn module_enabled(&self, section: &str) -> bool {
        self.modules.get(section).is_none_or(|module| module.enable)
    }
}

/// Store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// Notification channel name.
    pub channel: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: defaults::MAX_CONNECTIONS,
            channel: defaults::CHANNEL.to_string(),
        }
    }
}

/// Credentials used to obtain the authorization session.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Client identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Remote fetch implementation selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchTransportKind {
    /// In-process HTTP client.
    #[default]
    Fetch,
    /// External `curl` process.
    Curl,
}

impl FetchTransportKind {
    /// Parse a selector label.
    #[must_use]
    pub fn from_label(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fetch" => Some(Self::Fetch),
            "curl" => Some(Self::Curl),
            _ => None,
        }
    }
}

/// Filesystem target and remote fetch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesConfig {
    /// Root directory declared paths are resolved against.
    pub root: PathBuf,
    /// Remote fetch transport.
    pub transport: FetchTransportKind,
    /// Octal mode for created directories.
    pub dir_mode: String,
    /// Octal mode for written files.
    pub file_mode: String,
    /// Remote fetch timeout in seconds.
    pub fetch_timeout_secs: u64,
    /// Binary used by the `curl` transport.
    pub curl_binary: PathBuf,
}

impl FilesConfig {
    /// Parsed directory mode.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` when the mode is not valid octal.
    pub fn dir_mode_bits(&self) -> ConfigResult<u32> {
        parse_octal_mode("dir_mode", &self.dir_mode)
    }

    /// Parsed file mode.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` when the mode is not valid octal.
    pub fn file_mode_bits(&self) -> ConfigResult<u32> {
        parse_octal_mode("file_mode", &self.file_mode)
    }

    /// Remote fetch timeout.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(defaults::FILES_ROOT),
            transport: FetchTransportKind::default(),
            dir_mode: defaults::DIR_MODE.to_string(),
            file_mode: defaults::FILE_MODE.to_string(),
            fetch_timeout_secs: defaults::FETCH_TIMEOUT_SECS,
            curl_binary: PathBuf::from(defaults::CURL_BINARY),
        }
    }
}

/// Heartbeat cadences and handler limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Interval between heartbeat ticks in milliseconds.
    pub tick_millis: u64,
    /// Interval between channel health checks in seconds.
    pub listen_check_secs: u64,
    /// Interval between authorization checks in seconds.
    pub auth_refresh_secs: u64,
    /// Age in seconds after which a held session is replaced even if it was
    /// never rejected.
    pub session_max_age_secs: u64,
    /// Seconds a dispatched query may run before its handler is reaped.
    pub handler_timeout_secs: u64,
    /// Upper bound on concurrently dispatched operations.
    pub max_in_flight: usize,
}

impl HeartbeatConfig {
    /// Heartbeat tick interval.
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Channel health-check interval.
    #[must_use]
    pub const fn listen_check(&self) -> Duration {
        Duration::from_secs(self.listen_check_secs)
    }

    /// Authorization refresh interval.
    #[must_use]
    pub const fn auth_refresh(&self) -> Duration {
        Duration::from_secs(self.auth_refresh_secs)
    }

    /// Maximum session age before a fresh login.
    #[must_use]
    pub const fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    /// Handler timeout.
    #[must_use]
    pub const fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick_millis: defaults::TICK_MILLIS,
            listen_check_secs: defaults::LISTEN_CHECK_SECS,
            auth_refresh_secs: defaults::AUTH_REFRESH_SECS,
            session_max_age_secs: defaults::SESSION_MAX_AGE_SECS,
            handler_timeout_secs: defaults::HANDLER_TIMEOUT_SECS,
            max_in_flight: defaults::MAX_IN_FLIGHT,
        }
    }
}

/// Per-module settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleSection {
    /// Whether the module runs.
    pub enable: bool,
}

impl Default for ModuleSection {
    fn default() -> Self {
        Self { enable: true }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatKind {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Level used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format; inferred from the build profile when absent.
    pub format: Option<LogFormatKind>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: None,
        }
    }
}
