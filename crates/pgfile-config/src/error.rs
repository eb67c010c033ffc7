//! Failures raised while loading or validating the pgfile document.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for the loader and validators.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Why a configuration document was rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file named by `PGFILE_CONFIG` could not be read.
    #[error("failed to read configuration file")]
    Io {
        /// Requested path.
        path: PathBuf,
        /// Filesystem error.
        source: io::Error,
    },
    /// The document is not valid YAML for [`crate::SyncConfig`].
    #[error("failed to parse configuration document")]
    Parse {
        /// Source path; `None` for inline documents.
        path: Option<PathBuf>,
        /// Parser error.
        source: serde_yaml::Error,
    },
    /// A value parsed but failed validation.
    #[error("invalid configuration field")]
    InvalidField {
        /// Top-level section, e.g. `files`.
        section: &'static str,
        /// Field within the section.
        field: &'static str,
        /// Stable reason label, e.g. `invalid_octal`.
        reason: &'static str,
        /// Rejected value, when one was supplied.
        value: Option<String>,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: &'static str,
        field: &'static str,
        reason: &'static str,
        value: Option<String>,
    ) -> Self {
        Self::InvalidField {
            section,
            field,
            reason,
            value,
        }
    }
}

impl ConfigError {
    /// `section.field` for field errors, `None` otherwise.
    #[must_use]
    pub fn field_path(&self) -> Option<String> {
        match self {
            Self::InvalidField { section, field, .. } => Some(format!("{section}.{field}")),
            Self::Io { .. } | Self::Parse { .. } => None,
        }
    }
}
