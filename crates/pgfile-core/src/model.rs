//! Domain model shared by the data layer and the reconciliation engine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

static DIRECTIVE_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$"));

/// Opaque identifier of a desired-state row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change kind that triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl Operation {
    /// Wire label used by the store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(value: &str) -> SyncResult<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(SyncError::InvalidPayload {
                reason: "unknown_operation",
                value: Some(value.to_string()),
            }),
        }
    }
}

/// Declared type of a desired-state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file with inline content (`-`).
    Regular,
    /// Symbolic link or remote URL reference (`l`).
    SymlinkOrUrl,
    /// Tombstone marking the previous location for removal (`s`).
    Tombstone,
}

impl FileKind {
    /// Parse the single-character type marker stored in the row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRow` for markers outside `-`, `l`, `s`.
    pub fn from_marker(marker: &str) -> SyncResult<Self> {
        match marker {
            "-" => Ok(Self::Regular),
            "l" => Ok(Self::SymlinkOrUrl),
            "s" => Ok(Self::Tombstone),
            other => Err(SyncError::InvalidRow {
                field: "type",
                reason: "unknown_marker",
                value: Some(other.to_string()),
            }),
        }
    }

    /// Single-character marker for this kind.
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Regular => "-",
            Self::SymlinkOrUrl => "l",
            Self::Tombstone => "s",
        }
    }
}

/// Completion directive supplied by the desired-state row.
///
/// A directive names an upstream routine, either `name` or `schema.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive(String);

impl Directive {
    /// Parse an optional directive column. Empty values yield `None`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRow` when the value is not a plain or schema-qualified identifier.
    pub fn parse(field: &'static str, value: Option<&str>) -> SyncResult<Option<Self>> {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(None);
        };
        let valid = DIRECTIVE_PATTERN
            .as_ref()
            .is_ok_and(|pattern| pattern.is_match(raw));
        if !valid {
            return Err(SyncError::InvalidRow {
                field,
                reason: "invalid_directive",
                value: Some(raw.to_string()),
            });
        }
        Ok(Some(Self(raw.to_string())))
    }

    /// Borrow the directive name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authorization session used to bind the query batch.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    /// Wrap a session token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Borrow the raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

/// Raw notification received from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was published on.
    pub channel: String,
    /// Opaque payload.
    pub payload: String,
}

/// Parsed change notice describing which file changed and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Identifier of the desired-state row.
    pub file_id: FileId,
    /// Change kind.
    pub operation: Operation,
    /// Declared relative directory at notification time.
    pub path: String,
    /// Declared file name at notification time.
    pub name: String,
    /// Previously known content hash; empty for new files.
    pub hash: String,
}

#[derive(Deserialize)]
struct RawNotice {
    #[serde(alias = "file")]
    id: Option<Value>,
    operation: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

impl ChangeNotice {
    /// Parse a JSON notification payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` for malformed JSON, a missing identifier, or an
    /// unknown operation.
    pub fn parse(payload: &str) -> SyncResult<Self> {
        let raw: RawNotice =
            serde_json::from_str(payload).map_err(|_| SyncError::InvalidPayload {
                reason: "malformed_json",
                value: Some(payload.to_string()),
            })?;

        let file_id = match raw.id {
            Some(Value::String(text)) if !text.trim().is_empty() => FileId::new(text.trim()),
            Some(Value::Number(number)) => FileId::new(number.to_string()),
            _ => {
                return Err(SyncError::InvalidPayload {
                    reason: "missing_file_id",
                    value: Some(payload.to_string()),
                });
            }
        };
        let operation = raw
            .operation
            .as_deref()
            .ok_or(SyncError::InvalidPayload {
                reason: "missing_operation",
                value: None,
            })?
            .parse()?;

        Ok(Self {
            file_id,
            operation,
            path: raw.path.unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
            hash: raw.hash.unwrap_or_default(),
        })
    }
}

/// Result of the authorization stage (statement 0 of the batch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeRow {
    /// Whether the session was affirmed.
    pub authorized: bool,
    /// Upstream message, usually set when authorization fails.
    pub message: Option<String>,
}

/// Raw desired-state row (statement 1 of the batch).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRow {
    /// Type marker (`-`, `l`, `s`).
    pub kind: Option<String>,
    /// Declared relative directory.
    pub path: Option<String>,
    /// Declared file name.
    pub name: Option<String>,
    /// Content hash.
    pub hash: Option<String>,
    /// Content type.
    pub mime: Option<String>,
    /// Base64-encoded payload.
    pub data: Option<String>,
    /// Success directive.
    pub done: Option<String>,
    /// Failure directive.
    pub fail: Option<String>,
}

/// Positional results of the two-statement query batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResults {
    /// Rows returned by the authorization statement.
    pub authorize: Vec<AuthorizeRow>,
    /// Rows returned by the desired-state fetch.
    pub file: Vec<FileRow>,
}

/// Validated desired state for one file, alive for a single reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredFileState {
    /// Declared type.
    pub kind: FileKind,
    /// Declared relative directory.
    pub path: String,
    /// Declared file name.
    pub name: String,
    /// Content hash.
    pub hash: String,
    /// Content type.
    pub mime: String,
    /// Encoded payload.
    pub data: String,
    /// Directive reported on success.
    pub done_action: Option<Directive>,
    /// Directive reported on failure.
    pub fail_action: Option<Directive>,
}

impl TryFrom<FileRow> for DesiredFileState {
    type Error = SyncError;

    fn try_from(row: FileRow) -> SyncResult<Self> {
        let marker = row.kind.as_deref().ok_or(SyncError::InvalidRow {
            field: "type",
            reason: "missing",
            value: None,
        })?;
        let kind = FileKind::from_marker(marker)?;
        let done_action = Directive::parse("done", row.done.as_deref())?;
        let fail_action = Directive::parse("fail", row.fail.as_deref())?;
        Ok(Self {
            kind,
            path: row.path.unwrap_or_default(),
            name: row.name.unwrap_or_default(),
            hash: row.hash.unwrap_or_default(),
            mime: row.mime.unwrap_or_default(),
            data: row.data.unwrap_or_default(),
            done_action,
            fail_action,
        })
    }
}

/// Outcome carried by a completion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The file was materialised on disk.
    Done {
        /// Content type of the written payload, when known.
        content_type: Option<String>,
        /// Number of bytes written.
        size: u64,
        /// Absolute path that was written.
        path: PathBuf,
    },
    /// The operation failed.
    Failed {
        /// Human-readable failure description.
        message: String,
    },
}

/// Report delivered upstream through a completion directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    /// Directive to invoke.
    pub directive: Directive,
    /// File the report concerns.
    pub file_id: FileId,
    /// What happened.
    pub outcome: CompletionOutcome,
}

impl CompletionReport {
    /// JSON detail passed alongside the directive.
    #[must_use]
    pub fn detail(&self) -> Value {
        match &self.outcome {
            CompletionOutcome::Done {
                content_type,
                size,
                path,
            } => serde_json::json!({
                "status": "done",
                "content_type": content_type,
                "size": size,
                "path": path.display().to_string(),
            }),
            CompletionOutcome::Failed { message } => serde_json::json!({
                "status": "failed",
                "message": message,
            }),
        }
    }
}
