//! Failures raised by the PostgreSQL adapters.
//!
//! Every variant converts into [`SyncError::Transport`] so the engine sees one
//! transport category regardless of which statement failed.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use pgfile_core::SyncError;

/// Result alias for the PostgreSQL adapters.
pub type Result<T> = std::result::Result<T, DataError>;

/// Statement or row-mapping failure inside an adapter.
#[derive(Debug)]
pub enum DataError {
    /// A statement or listener call returned an error.
    Statement {
        /// Adapter step that issued the call.
        operation: &'static str,
        /// Driver error.
        source: sqlx::Error,
    },
    /// A result row lacked a column the pipeline depends on.
    ColumnDecode {
        /// Statement that produced the row.
        statement: &'static str,
        /// Column that could not be read.
        column: &'static str,
        /// Underlying decode error.
        source: sqlx::Error,
    },
}

impl DataError {
    pub(crate) const fn query(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Statement { operation, source }
    }

    const fn operation(&self) -> &'static str {
        match self {
            Self::Statement { operation, .. } => operation,
            Self::ColumnDecode { statement, .. } => statement,
        }
    }
}

impl Display for DataError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement { .. } => formatter.write_str("postgres statement failed"),
            Self::ColumnDecode { .. } => formatter.write_str("result column could not be decoded"),
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Statement { source, .. } | Self::ColumnDecode { source, .. } => Some(source),
        }
    }
}

impl From<sqlx::Error> for DataError {
    fn from(source: sqlx::Error) -> Self {
        Self::Statement {
            operation: "postgres",
            source,
        }
    }
}

impl From<DataError> for SyncError {
    fn from(error: DataError) -> Self {
        let operation = error.operation();
        Self::transport(operation, error)
    }
}
