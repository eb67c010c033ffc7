//! Telemetry failures.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use prometheus::Error as PrometheusError;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors raised while installing logging or maintaining metrics.
#[derive(Debug)]
pub enum TelemetryError {
    /// A global tracing subscriber was already installed.
    LoggerInstall {
        /// Underlying subscriber error.
        source: tracing_subscriber::util::TryInitError,
    },
    /// A collector could not be built or registered.
    Collector {
        /// `build` or `register`.
        operation: &'static str,
        /// Metric name.
        metric: &'static str,
        /// Underlying Prometheus error.
        source: PrometheusError,
    },
    /// Text exposition could not be produced.
    Render {
        /// Underlying encode or UTF-8 failure.
        source: Box<dyn Error + Send + Sync>,
    },
}

impl TelemetryError {
    pub(crate) const fn collector(
        operation: &'static str,
        metric: &'static str,
        source: PrometheusError,
    ) -> Self {
        Self::Collector {
            operation,
            metric,
            source,
        }
    }

    pub(crate) fn render(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Render {
            source: source.into(),
        }
    }
}

impl Display for TelemetryError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggerInstall { .. } => formatter.write_str("log subscriber already installed"),
            Self::Collector { .. } => formatter.write_str("metrics collector setup failed"),
            Self::Render { .. } => formatter.write_str("metrics rendering failed"),
        }
    }
}

impl Error for TelemetryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::LoggerInstall { source } => Some(source),
            Self::Collector { source, .. } => Some(source),
            Self::Render { source } => Some(source.as_ref()),
        }
    }
}
