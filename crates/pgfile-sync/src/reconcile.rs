//! Filesystem decisions for one fetched desired-state row.

use std::path::{Path, PathBuf};

use pgfile_core::{DesiredFileState, FileKind, Operation, SyncResult};
use reqwest::Url;

use crate::fetch::FetchJob;
use crate::handler::FileHandler;
use crate::paths;
use crate::pipeline::decode_payload;

const HTTPS_PREFIX: &str = "https://";
const HTTP_PREFIX: &str = "http://";

/// Terminal action taken for a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Decoded payload written to disk.
    Written {
        /// Destination path.
        path: PathBuf,
        /// Bytes written.
        bytes: u64,
        /// Declared content type.
        content_type: Option<String>,
    },
    /// File removed (tombstone or delete notification).
    Deleted {
        /// Removed path.
        path: PathBuf,
        /// Whether a file was actually present.
        existed: bool,
    },
    /// Handed to the remote fetch dispatcher.
    Fetch(FetchJob),
    /// Nothing to do.
    NoOp(NoOpReason),
}

impl Action {
    /// Stable label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Written { .. } => "written",
            Self::Deleted { .. } => "deleted",
            Self::Fetch(_) => "fetch_dispatched",
            Self::NoOp(reason) => reason.label(),
        }
    }
}

/// Why a pass ended without touching the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Declared payload was empty.
    EmptyPayload,
    /// UPDATE with unchanged path and hash.
    Unchanged,
    /// Link payload is not an HTTP(S) URL.
    UnrecognisedLink,
}

impl NoOpReason {
    /// Stable label for metrics and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::EmptyPayload => "empty_payload",
            Self::Unchanged => "unchanged",
            Self::UnrecognisedLink => "unrecognised_link",
        }
    }
}

/// Applies desired state under a fixed root.
#[derive(Debug, Clone)]
pub struct Reconciler {
    root: PathBuf,
    dir_mode: u32,
    file_mode: u32,
}

impl Reconciler {
    /// Reconcile beneath `root`, creating directories with `dir_mode` and files with `file_mode`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, dir_mode: u32, file_mode: u32) -> Self {
        Self {
            root: root.into(),
            dir_mode,
            file_mode,
        }
    }

    /// Configured root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bring the disk in line with `desired` for `handler`.
    ///
    /// The handler's `absolute_name` still holds the notified location on
    /// entry; it is replaced with the fetched location before branching.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath`, `Decode`, or `Io` errors; the caller retires the
    /// handler either way.
    pub fn apply(&self, handler: &mut FileHandler, desired: DesiredFileState) -> SyncResult<Action> {
        let resolved = paths::resolve(&self.root, &desired.path, &desired.name)?;
        paths::ensure_directories(&resolved, self.dir_mode)?;

        if desired.data.is_empty() {
            return Ok(Action::NoOp(NoOpReason::EmptyPayload));
        }

        let previous = std::mem::replace(&mut handler.absolute_name, resolved.clone());
        handler.done_action.clone_from(&desired.done_action);

        match desired.kind {
            FileKind::Regular => self.apply_regular(handler, &previous, resolved, desired),
            FileKind::SymlinkOrUrl => Ok(Self::apply_link(handler, resolved, desired)),
            FileKind::Tombstone => {
                let existed = paths::delete_file(&previous)?;
                Ok(Action::Deleted {
                    path: previous,
                    existed,
                })
            }
        }
    }

    fn apply_regular(
        &self,
        handler: &FileHandler,
        previous: &Path,
        resolved: PathBuf,
        desired: DesiredFileState,
    ) -> SyncResult<Action> {
        let update = handler.operation() == Operation::Update;
        let moved = previous != resolved.as_path();
        let changed = update && (moved || handler.hash() != desired.hash);

        if update && moved {
            paths::delete_file(previous)?;
        }

        if handler.operation() == Operation::Insert || changed {
            let bytes = decode_payload(&desired.data)?;
            let written = paths::write_atomic(&resolved, &bytes, self.file_mode)?;
            return Ok(Action::Written {
                path: resolved,
                bytes: written,
                content_type: Some(desired.mime).filter(|mime| !mime.is_empty()),
            });
        }

        Ok(Action::NoOp(NoOpReason::Unchanged))
    }

    fn apply_link(
        handler: &mut FileHandler,
        resolved: PathBuf,
        desired: DesiredFileState,
    ) -> Action {
        let Ok(decoded) = decode_payload(&desired.data) else {
            return Action::NoOp(NoOpReason::UnrecognisedLink);
        };
        let target = String::from_utf8_lossy(&decoded).into_owned();
        let fetchable = (target.starts_with(HTTPS_PREFIX) || target.starts_with(HTTP_PREFIX))
            && Url::parse(&target).is_ok();
        if !fetchable {
            return Action::NoOp(NoOpReason::UnrecognisedLink);
        }

        handler.uri = Some(target.clone());
        handler.fail_action.clone_from(&desired.fail_action);
        Action::Fetch(FetchJob {
            file_id: handler.file_id().clone(),
            uri: target,
            absolute_name: resolved,
            done_action: desired.done_action,
            fail_action: desired.fail_action,
        })
    }

    /// Remove the notified file for a DELETE event without consulting the store.
    ///
    /// # Errors
    ///
    /// Returns `Io` when removal fails for a reason other than absence.
    pub fn delete_direct(handler: &FileHandler) -> SyncResult<Action> {
        let existed = paths::delete_file(&handler.absolute_name)?;
        Ok(Action::Deleted {
            path: handler.absolute_name.clone(),
            existed,
        })
    }
}
