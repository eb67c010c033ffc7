//! Per-event state tracked from notification receipt to retirement.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pgfile_core::{ChangeNotice, Directive, FileId, Operation, SyncResult};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::paths;

/// Arena key for a live handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Dispatch state. A handler accepts at most one outstanding query.
#[derive(Debug)]
pub enum HandlerState {
    /// Waiting in the queue.
    Queued,
    /// Query batch submitted; further dispatch is disabled.
    Querying {
        /// When the batch was submitted.
        since: Instant,
        /// Handle used to cancel the batch on reap or shutdown.
        abort: AbortHandle,
    },
}

/// One in-flight change event.
#[derive(Debug)]
pub struct FileHandler {
    id: HandlerId,
    file_id: FileId,
    operation: Operation,
    path: String,
    name: String,
    hash: String,
    /// Resolved on-disk location; starts at the notified location and is
    /// replaced by the fetched one during reconciliation.
    pub absolute_name: PathBuf,
    /// Remote reference, set only for links that resolve to a URL.
    pub uri: Option<String>,
    /// Directive reported upstream on success.
    pub done_action: Option<Directive>,
    /// Directive reported upstream on failure.
    pub fail_action: Option<Directive>,
    created_at: Instant,
    state: HandlerState,
}

impl FileHandler {
    /// Build a queued handler from a parsed notice, resolving its location under `root`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` when the notified location escapes `root`.
    pub fn from_notice(
        id: HandlerId,
        notice: ChangeNotice,
        root: &Path,
        now: Instant,
    ) -> SyncResult<Self> {
        let absolute_name = paths::resolve(root, &notice.path, &notice.name)?;
        Ok(Self {
            id,
            file_id: notice.file_id,
            operation: notice.operation,
            path: notice.path,
            name: notice.name,
            hash: notice.hash,
            absolute_name,
            uri: None,
            done_action: None,
            fail_action: None,
            created_at: now,
            state: HandlerState::Queued,
        })
    }

    /// Arena key.
    #[must_use]
    pub const fn id(&self) -> HandlerId {
        self.id
    }

    /// Desired-state row this handler reconciles.
    #[must_use]
    pub const fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Change kind that created the handler.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// Notified relative directory.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Notified file name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Previously known content hash.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Current dispatch state.
    #[must_use]
    pub const fn state(&self) -> &HandlerState {
        &self.state
    }

    /// Whether the handler is still waiting for dispatch.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self.state, HandlerState::Queued)
    }

    /// Whether a query batch is outstanding.
    #[must_use]
    pub const fn is_querying(&self) -> bool {
        matches!(self.state, HandlerState::Querying { .. })
    }

    /// Record batch submission.
    pub fn mark_querying(&mut self, abort: AbortHandle, now: Instant) {
        self.state = HandlerState::Querying { since: now, abort };
    }

    /// Cancel the outstanding batch, if any.
    pub fn abort(&self) {
        if let HandlerState::Querying { abort, .. } = &self.state {
            abort.abort();
        }
    }

    /// Whether an outstanding batch has run for at least `timeout`.
    ///
    /// Queued handlers never expire; they wait on the engine, not on a callback.
    #[must_use]
    pub fn expired(&self, now: Instant, timeout: Duration) -> bool {
        match &self.state {
            HandlerState::Queued => false,
            HandlerState::Querying { since, .. } => {
                now.saturating_duration_since(*since) >= timeout
            }
        }
    }

    /// Time since creation.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use pgfile_core::SyncError;

    fn notice(path: &str, name: &str) -> ChangeNotice {
        ChangeNotice {
            file_id: FileId::new("7"),
            operation: Operation::Update,
            path: path.to_string(),
            name: name.to_string(),
            hash: "h1".to_string(),
        }
    }

    #[test]
    fn handler_resolves_notified_location() -> Result<()> {
        let now = Instant::now();
        let handler =
            FileHandler::from_notice(HandlerId::new(1), notice("/a", "x.txt"), Path::new("/r"), now)?;
        assert_eq!(handler.absolute_name, PathBuf::from("/r/a/x.txt"));
        assert!(handler.is_queued());
        assert_eq!(handler.hash(), "h1");
        assert_eq!(handler.id().to_string(), "h1");
        Ok(())
    }

    #[test]
    fn handler_rejects_escaping_location() {
        let result = FileHandler::from_notice(
            HandlerId::new(1),
            notice("/../etc", "passwd"),
            Path::new("/r"),
            Instant::now(),
        );
        assert!(matches!(result, Err(SyncError::InvalidPath { .. })));
    }

    #[tokio::test]
    async fn querying_handler_expires_from_dispatch_and_aborts() -> Result<()> {
        let created = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut handler = FileHandler::from_notice(
            HandlerId::new(2),
            notice("a", "x"),
            Path::new("/r"),
            created,
        )?;
        assert!(!handler.expired(created + Duration::from_secs(3600), timeout));

        let dispatched = created + Duration::from_secs(30);
        let task = tokio::spawn(std::future::pending::<()>());
        handler.mark_querying(task.abort_handle(), dispatched);
        assert!(handler.is_querying());
        assert!(!handler.expired(dispatched + Duration::from_secs(5), timeout));
        assert!(handler.expired(dispatched + timeout, timeout));
        assert_eq!(handler.age(dispatched), Duration::from_secs(30));

        handler.abort();
        let joined = task.await;
        assert!(joined.is_err_and(|err| err.is_cancelled()));
        Ok(())
    }
}
