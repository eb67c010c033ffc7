//! Bootstrap failures surfaced by the `pgfile` binary.
//!
//! Each variant names the boot step in `operation` and keeps the underlying
//! error as its source; callers do not log before returning these.

use thiserror::Error;

/// Result alias for the boot sequence.
pub type AppResult<T> = Result<T, AppError>;

/// Why the binary could not start or finished abnormally.
#[derive(Debug, Error)]
pub enum AppError {
    /// Loading the document or deriving engine settings failed.
    #[error("configuration operation failed")]
    Config {
        /// Boot step, e.g. `database.connect`.
        operation: &'static str,
        /// Loader or validation error.
        source: pgfile_config::ConfigError,
    },
    /// Installing the log subscriber failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Boot step, e.g. `database.connect`.
        operation: &'static str,
        /// Subscriber error.
        source: pgfile_telemetry::TelemetryError,
    },
    /// The connection pool could not be opened.
    #[error("database operation failed")]
    Database {
        /// Boot step, e.g. `database.connect`.
        operation: &'static str,
        /// Pool error.
        source: sqlx::Error,
    },
    /// A port or transport could not be constructed.
    #[error("engine operation failed")]
    Engine {
        /// Boot step, e.g. `database.connect`.
        operation: &'static str,
        /// Construction error.
        source: pgfile_core::SyncError,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: pgfile_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: pgfile_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn database(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Database { operation, source }
    }

    pub(crate) const fn engine(operation: &'static str, source: pgfile_core::SyncError) -> Self {
        Self::Engine { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn app_error_messages_are_constant() {
        let database = AppError::database("database.connect", sqlx::Error::PoolTimedOut);
        assert_eq!(database.to_string(), "database operation failed");
        assert!(database.source().is_some());

        let engine = AppError::engine(
            "transport.build",
            pgfile_core::SyncError::NotFound {
                file_id: "7".into(),
            },
        );
        assert_eq!(engine.to_string(), "engine operation failed");
        assert!(matches!(
            engine,
            AppError::Engine {
                operation: "transport.build",
                ..
            }
        ));
    }
}
