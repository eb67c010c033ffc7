//! Tracing subscriber installation for the pgfile binary.
//!
//! `RUST_LOG` takes precedence over the configured directive. A configured
//! directive that does not parse falls back to [`DEFAULT_LOG_LEVEL`] rather
//! than failing startup.

use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TelemetryError};

/// Directive used when neither `RUST_LOG` nor configuration supply one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

static BUILD_SHA: OnceCell<String> = OnceCell::new();

/// Inputs for [`init_logging`].
#[derive(Debug, Clone)]
pub struct LogSettings<'a> {
    /// `EnvFilter` directive, e.g. `info` or `pgfile_sync=debug,info`.
    pub level: &'a str,
    /// Output encoding.
    pub format: LogFormat,
    /// Include the emitting module path in each event.
    pub with_targets: bool,
    /// Build identifier reported by [`build_sha`].
    pub build_sha: &'a str,
}

impl Default for LogSettings<'_> {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            format: LogFormat::infer(),
            with_targets: false,
            build_sha: build_sha(),
        }
    }
}

/// Log output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable lines.
    Pretty,
}

impl LogFormat {
    /// Pretty output for debug builds, JSON for release builds.
    #[must_use]
    pub const fn infer() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }

    /// Stable label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::LoggerInstall`] when a global subscriber is
/// already set.
pub fn init_logging(settings: &LogSettings<'_>) -> Result<()> {
    // First caller wins; later calls keep the recorded value.
    let _ = BUILD_SHA.set(settings.build_sha.to_string());

    let filter = filter_for(settings.level);
    let installed = match settings.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(settings.with_targets),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(settings.with_targets))
            .try_init(),
    };
    installed.map_err(|source| TelemetryError::LoggerInstall { source })?;

    debug!(
        format = settings.format.label(),
        build_sha = build_sha(),
        "logging installed"
    );
    Ok(())
}

/// Build SHA recorded by [`init_logging`], or `dev` before installation.
#[must_use]
pub fn build_sha() -> &'static str {
    BUILD_SHA.get().map_or("dev", String::as_str)
}

fn filter_for(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_info_and_inferred_format() {
        let settings = LogSettings::default();
        assert_eq!(settings.level, DEFAULT_LOG_LEVEL);
        assert_eq!(settings.format, LogFormat::infer());
        assert!(!settings.with_targets);
    }

    #[test]
    fn format_labels_are_stable() {
        assert_eq!(LogFormat::Json.label(), "json");
        assert_eq!(LogFormat::Pretty.label(), "pretty");
    }

    #[test]
    fn second_install_is_rejected() {
        let settings = LogSettings {
            level: "pgfile_sync=debug,info",
            format: LogFormat::Pretty,
            with_targets: true,
            build_sha: "abc123",
        };
        let _ = init_logging(&settings);
        let err = init_logging(&settings).err();
        assert!(matches!(err, Some(TelemetryError::LoggerInstall { .. })));
    }
}
