//! Collaborator traits the reconciliation engine calls but does not own.

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::model::{BatchResults, CompletionReport, FileId, Notification, Session};

/// Executes the two-statement batch (authorize, then fetch desired state).
#[async_trait]
pub trait FileStateSource: Send + Sync {
    /// Run both statements as one unit and return their rows positionally.
    async fn fetch_file_state(&self, session: &Session, file_id: &FileId)
    -> SyncResult<BatchResults>;
}

/// Acquires or refreshes the authorization session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a fresh session.
    async fn authenticate(&self) -> SyncResult<Session>;
}

/// Opens subscriptions on a named notification channel.
#[async_trait]
pub trait NotificationSubscriber: Send + Sync {
    /// Subscribe to `channel`, returning the live notification stream.
    async fn subscribe(&self, channel: &str) -> SyncResult<Box<dyn NotificationSource>>;
}

/// A live subscription delivering notifications in arrival order.
#[async_trait]
pub trait NotificationSource: Send {
    /// Wait for the next notification.
    async fn recv(&mut self) -> SyncResult<Notification>;

    /// Probe whether the subscription is still registered for `channel`.
    async fn is_listening(&mut self, channel: &str) -> SyncResult<bool>;
}

/// Delivers completion directives upstream.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Report a completed or failed file operation.
    async fn report(&self, report: CompletionReport) -> SyncResult<()>;
}

/// Body returned by a remote fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    /// Response bytes.
    pub bytes: Vec<u8>,
    /// Content type advertised by the remote, when known.
    pub content_type: Option<String>,
}

/// Outbound transport used to retrieve remote references.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    /// Short label identifying the transport in logs.
    fn name(&self) -> &'static str;

    /// Fetch `url` and return its body.
    async fn fetch(&self, url: &str) -> SyncResult<FetchedBody>;
}
