//! # Design
//!
//! - One taxonomy for every failure the reconciliation pipeline can observe.
//! - Constant messages; context travels in fields so logs stay structured.
//! - `NotFound` exists for completeness but the pipeline treats it as benign.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Boxed error type carried across port boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias for pipeline operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the notification-driven file pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The authorization stage of the query batch did not affirm the session.
    #[error("authorization failed")]
    Authorization {
        /// Message reported by the upstream authorization routine.
        message: String,
    },
    /// The asynchronous call could not be submitted or failed in transit.
    #[error("transport failure")]
    Transport {
        /// Operation that was being performed.
        operation: &'static str,
        /// Underlying transport error.
        source: BoxError,
    },
    /// The desired-state row vanished before it could be fetched.
    #[error("desired state not found")]
    NotFound {
        /// Identifier of the missing row.
        file_id: String,
    },
    /// Subscribing to the notification channel failed.
    #[error("channel subscription failed")]
    Subscription {
        /// Channel that could not be subscribed.
        channel: String,
        /// Underlying subscribe error.
        source: BoxError,
    },
    /// A notification payload could not be interpreted.
    #[error("invalid notification payload")]
    InvalidPayload {
        /// Machine-readable reason for the rejection.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A fetched row contained an unusable field.
    #[error("invalid desired-state row")]
    InvalidRow {
        /// Column that failed validation.
        field: &'static str,
        /// Machine-readable reason for the rejection.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// A declared location escapes the configured root or is malformed.
    #[error("invalid declared path")]
    InvalidPath {
        /// Field that carried the path.
        field: &'static str,
        /// Machine-readable reason for the rejection.
        reason: &'static str,
        /// Offending value.
        value: String,
    },
    /// The encoded payload could not be decoded.
    #[error("payload decode failed")]
    Decode {
        /// Underlying base64 error.
        source: base64::DecodeError,
    },
    /// Filesystem operation failed.
    #[error("filesystem operation failed")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Remote fetch failed.
    #[error("remote fetch failed")]
    Fetch {
        /// Requested URL.
        url: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Additional detail from the transport.
        detail: Option<String>,
    },
}

impl SyncError {
    /// Build a transport error from any error type.
    pub fn transport<E>(operation: &'static str, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Transport {
            operation,
            source: Box::new(source),
        }
    }

    /// Build an IO error tagged with the operation and path.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Stable label used for metrics and log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Authorization { .. } => "authorization",
            Self::Transport { .. } => "transport",
            Self::NotFound { .. } => "not_found",
            Self::Subscription { .. } => "subscription",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::InvalidRow { .. } => "invalid_row",
            Self::InvalidPath { .. } => "invalid_path",
            Self::Decode { .. } => "decode",
            Self::Io { .. } => "io",
            Self::Fetch { .. } => "fetch",
        }
    }
}

impl From<base64::DecodeError> for SyncError {
    fn from(source: base64::DecodeError) -> Self {
        Self::Decode { source }
    }
}
