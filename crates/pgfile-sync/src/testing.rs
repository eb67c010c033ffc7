//! In-memory fakes of every port used by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pgfile_core::{
    Authenticator, AuthorizeRow, BatchResults, CompletionReport, CompletionSink, FetchTransport,
    FetchedBody, FileId, FileRow, FileStateSource, Notification, NotificationSource,
    NotificationSubscriber, Session, SyncError, SyncResult,
};
use tokio::sync::{Notify, mpsc};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct TestTransportError(&'static str);

impl std::fmt::Display for TestTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for TestTransportError {}

/// Desired-state store keyed by file id.
#[derive(Default)]
pub(crate) struct FakeStore {
    rows: Mutex<HashMap<FileId, FileRow>>,
    denial: Mutex<Option<String>>,
    calls: Mutex<Vec<FileId>>,
    hang: AtomicBool,
    broken: AtomicBool,
}

impl FakeStore {
    pub(crate) fn put(&self, file_id: &str, row: FileRow) {
        lock(&self.rows).insert(FileId::new(file_id), row);
    }

    pub(crate) fn deny(&self, message: &str) {
        *lock(&self.denial) = Some(message.to_string());
    }

    pub(crate) fn allow(&self) {
        *lock(&self.denial) = None;
    }

    pub(crate) fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Later batches complete normally; already hanging ones stay pending.
    pub(crate) fn resume(&self) {
        self.hang.store(false, Ordering::SeqCst);
    }

    pub(crate) fn break_transport(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<FileId> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FileStateSource for FakeStore {
    async fn fetch_file_state(
        &self,
        _session: &Session,
        file_id: &FileId,
    ) -> SyncResult<BatchResults> {
        lock(&self.calls).push(file_id.clone());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(SyncError::transport(
                "fetch file state",
                TestTransportError("connection reset"),
            ));
        }
        if let Some(message) = lock(&self.denial).clone() {
            return Ok(BatchResults {
                authorize: vec![AuthorizeRow {
                    authorized: false,
                    message: Some(message),
                }],
                file: Vec::new(),
            });
        }
        Ok(BatchResults {
            authorize: vec![AuthorizeRow {
                authorized: true,
                message: None,
            }],
            file: lock(&self.rows).get(file_id).cloned().into_iter().collect(),
        })
    }
}

/// Authenticator returning a fixed session, optionally failing.
#[derive(Default)]
pub(crate) struct FakeAuth {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeAuth {
    pub(crate) fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for FakeAuth {
    async fn authenticate(&self) -> SyncResult<Session> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Authorization {
                message: "invalid client".to_string(),
            });
        }
        Ok(Session::new("token"))
    }
}

/// Subscriber whose sources are fed by [`FakeSubscriber::publish`].
pub(crate) struct FakeSubscriber {
    subscriptions: AtomicUsize,
    failures_left: AtomicUsize,
    listening: Arc<AtomicBool>,
    sender: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

impl Default for FakeSubscriber {
    fn default() -> Self {
        Self {
            subscriptions: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            listening: Arc::new(AtomicBool::new(false)),
            sender: Mutex::new(None),
        }
    }
}

impl FakeSubscriber {
    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Close the live source so its next receive fails.
    pub(crate) fn close(&self) {
        lock(&self.sender).take();
    }

    pub(crate) fn publish(&self, channel: &str, payload: &str) -> bool {
        lock(&self.sender).as_ref().is_some_and(|sender| {
            sender
                .send(Notification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
        })
    }
}

#[async_trait]
impl NotificationSubscriber for FakeSubscriber {
    async fn subscribe(&self, channel: &str) -> SyncResult<Box<dyn NotificationSource>> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Subscription {
                channel: channel.to_string(),
                source: Box::new(TestTransportError("listen rejected")),
            });
        }
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.listening.store(true, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.sender) = Some(sender);
        Ok(Box::new(FakeSource {
            receiver,
            listening: Arc::clone(&self.listening),
        }))
    }
}

struct FakeSource {
    receiver: mpsc::UnboundedReceiver<Notification>,
    listening: Arc<AtomicBool>,
}

#[async_trait]
impl NotificationSource for FakeSource {
    async fn recv(&mut self) -> SyncResult<Notification> {
        self.receiver.recv().await.ok_or_else(|| {
            SyncError::transport("receive notification", TestTransportError("channel closed"))
        })
    }

    async fn is_listening(&mut self, _channel: &str) -> SyncResult<bool> {
        Ok(self.listening.load(Ordering::SeqCst))
    }
}

/// Sink that records every report.
#[derive(Default)]
pub(crate) struct RecordingSink {
    reports: Mutex<Vec<CompletionReport>>,
}

impl RecordingSink {
    pub(crate) fn reports(&self) -> Vec<CompletionReport> {
        lock(&self.reports).clone()
    }
}

#[async_trait]
impl CompletionSink for RecordingSink {
    async fn report(&self, report: CompletionReport) -> SyncResult<()> {
        lock(&self.reports).push(report);
        Ok(())
    }
}

/// Transport serving canned bodies; unknown URLs fail with `not_found`.
#[derive(Default)]
pub(crate) struct FakeTransport {
    bodies: Mutex<HashMap<String, FetchedBody>>,
    calls: AtomicUsize,
    held: AtomicBool,
    release: Notify,
}

impl FakeTransport {
    pub(crate) fn respond(&self, url: &str, body: SyncResult<FetchedBody>) {
        if let Ok(body) = body {
            lock(&self.bodies).insert(url.to_string(), body);
        }
    }

    /// Block fetches until [`FakeTransport::release`] is called.
    pub(crate) fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchTransport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch(&self, url: &str) -> SyncResult<FetchedBody> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.held.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        lock(&self.bodies)
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::Fetch {
                url: url.to_string(),
                reason: "not_found",
                detail: None,
            })
    }
}
