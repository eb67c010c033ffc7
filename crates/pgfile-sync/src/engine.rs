//! Event loop composing the channel monitor, heartbeat, query pipeline,
//! reconciler, and fetch dispatcher.
//!
//! # Design
//! - One task owns every handler in an arena keyed by [`HandlerId`]; query,
//!   apply, fetch, and report work runs on a `JoinSet` and comes back as a
//!   [`TaskOutcome`] processed on the same task.
//! - Reconciliation touches the disk, so it runs on the blocking pool with
//!   the handler moved out of the arena; it comes back with the outcome.
//! - A handler is removed from the arena before it is retired, so retirement
//!   happens exactly once.
//! - `in_flight` holds file ids with an outstanding query, apply, or fetch;
//!   queued handlers for those ids wait, preserving per-file arrival order.
//! - Only dispatched handlers time out. Queued handlers wait for the engine,
//!   never for a callback, so they are kept until dispatched.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgfile_config::{ConfigResult, SyncConfig};
use pgfile_core::{
    Authenticator, ChangeNotice, CompletionOutcome, CompletionReport, CompletionSink,
    DesiredFileState, FetchTransport, FileId, FileStateSource, Notification,
    NotificationSubscriber, Operation, Session, SyncError, SyncResult,
};
use pgfile_telemetry::Metrics;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::fetch::{FetchJob, RemoteFetcher};
use crate::handler::{FileHandler, HandlerId};
use crate::heartbeat::HeartbeatSchedule;
use crate::monitor::{ChannelMonitor, SubscriptionStatus};
use crate::pipeline;
use crate::reconcile::{Action, Reconciler};

/// Runtime settings derived from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Notification channel name.
    pub channel: String,
    /// Root every declared path is resolved beneath.
    pub root: PathBuf,
    /// Mode for created directories.
    pub dir_mode: u32,
    /// Mode for written files.
    pub file_mode: u32,
    /// Heartbeat cadence.
    pub tick: Duration,
    /// Subscription probe interval.
    pub listen_check: Duration,
    /// Authorization check interval.
    pub auth_refresh: Duration,
    /// Age after which a held session is replaced.
    pub session_max_age: Duration,
    /// Time a dispatched query may run before its handler is reaped.
    pub handler_timeout: Duration,
    /// Cap on concurrent query/fetch operations.
    pub max_in_flight: usize,
}

impl EngineSettings {
    /// Derive settings from a validated configuration document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` when a permission mode is not valid octal.
    pub fn from_config(config: &SyncConfig) -> ConfigResult<Self> {
        Ok(Self {
            channel: config.database.channel.clone(),
            root: config.files.root.clone(),
            dir_mode: config.files.dir_mode_bits()?,
            file_mode: config.files.file_mode_bits()?,
            tick: config.heartbeat.tick(),
            listen_check: config.heartbeat.listen_check(),
            auth_refresh: config.heartbeat.auth_refresh(),
            session_max_age: config.heartbeat.session_max_age(),
            handler_timeout: config.heartbeat.handler_timeout(),
            max_in_flight: config.heartbeat.max_in_flight,
        })
    }
}

/// Collaborators the engine calls but does not own.
#[derive(Clone)]
pub struct EngineDeps {
    /// Query batch executor.
    pub source: Arc<dyn FileStateSource>,
    /// Session provider.
    pub authenticator: Arc<dyn Authenticator>,
    /// Notification channel.
    pub subscriber: Arc<dyn NotificationSubscriber>,
    /// Completion directive sink.
    pub sink: Arc<dyn CompletionSink>,
    /// Remote fetch transport.
    pub transport: Arc<dyn FetchTransport>,
}

/// What a single heartbeat tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The subscription probe was due.
    pub listen_checked: bool,
    /// A subscription is live after the tick.
    pub subscribed: bool,
    /// A fresh session was obtained.
    pub auth_refreshed: bool,
    /// Handlers dispatched to the query pipeline.
    pub dispatched: usize,
    /// Handlers reaped for exceeding the timeout.
    pub reaped: usize,
}

enum TaskOutcome {
    Query {
        handler: HandlerId,
        result: SyncResult<Option<DesiredFileState>>,
    },
    Applied {
        handler: Box<FileHandler>,
        result: SyncResult<Action>,
    },
    Fetch {
        file_id: FileId,
        result: SyncResult<u64>,
    },
    Report {
        file_id: FileId,
        result: SyncResult<()>,
    },
}

enum TaskKind {
    Query(HandlerId),
    Apply(FileId),
    Fetch(FileId),
    Report,
}

struct HeldSession {
    session: Session,
    obtained_at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Retirement {
    Completed(&'static str),
    FetchDispatched,
    Vanished,
    Failed,
    Expired,
}

impl Retirement {
    const fn label(self) -> &'static str {
        match self {
            Self::Completed(label) => label,
            Self::FetchDispatched => "fetch_dispatched",
            Self::Vanished => "vanished",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

/// Notification-driven reconciliation engine.
pub struct SyncEngine {
    settings: EngineSettings,
    deps: EngineDeps,
    metrics: Metrics,
    monitor: ChannelMonitor,
    heartbeat: HeartbeatSchedule,
    reconciler: Arc<Reconciler>,
    fetcher: Arc<RemoteFetcher>,
    session: Option<HeldSession>,
    handlers: HashMap<HandlerId, FileHandler>,
    queue: VecDeque<HandlerId>,
    in_flight: HashSet<FileId>,
    tasks: JoinSet<TaskOutcome>,
    task_kinds: HashMap<TaskId, TaskKind>,
    next_handler: u64,
}

impl SyncEngine {
    /// Assemble an engine; nothing runs until [`SyncEngine::run`] or [`SyncEngine::tick`].
    #[must_use]
    pub fn new(settings: EngineSettings, deps: EngineDeps, metrics: Metrics) -> Self {
        let monitor = ChannelMonitor::new(settings.channel.clone(), Arc::clone(&deps.subscriber));
        let heartbeat = HeartbeatSchedule::new(settings.listen_check, settings.auth_refresh);
        let reconciler = Arc::new(Reconciler::new(
            settings.root.clone(),
            settings.dir_mode,
            settings.file_mode,
        ));
        let fetcher = Arc::new(RemoteFetcher::new(
            Arc::clone(&deps.transport),
            Arc::clone(&deps.sink),
            settings.file_mode,
        ));
        Self {
            settings,
            deps,
            metrics,
            monitor,
            heartbeat,
            reconciler,
            fetcher,
            session: None,
            handlers: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: HashSet::new(),
            tasks: JoinSet::new(),
            task_kinds: HashMap::new(),
            next_handler: 0,
        }
    }

    /// Shared metrics handle.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handlers in the arena, queued or querying.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.handlers.len()
    }

    /// Handlers waiting for dispatch.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// File ids with an outstanding query, apply, or fetch.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a session is held.
    #[must_use]
    pub const fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the channel subscription is live.
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.monitor.is_subscribed()
    }

    /// Drive the engine until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            channel = %self.settings.channel,
            root = %self.settings.root.display(),
            transport = self.fetcher.transport_name(),
            "reconciliation engine started"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                now = interval.tick() => {
                    self.tick(now).await;
                }
                received = self.monitor.recv(), if self.monitor.is_subscribed() => {
                    match received {
                        Ok(notification) => self.handle_notification(notification, Instant::now()),
                        Err(err) => self.report_error(&err, None, "notification channel lost"),
                    }
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_joined(joined, Instant::now());
                }
            }
        }

        self.shutdown();
    }

    /// One heartbeat: subscription check, auth refresh, reap, then queue flush.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let due = self.heartbeat.tick(now);
        let mut report = TickReport {
            listen_checked: due.check_listen,
            ..TickReport::default()
        };

        if due.check_listen || !self.monitor.is_subscribed() {
            match self.monitor.ensure_subscription(due.check_listen).await {
                Ok(SubscriptionStatus::Subscribed) => self.metrics.inc_subscription(),
                Ok(SubscriptionStatus::Healthy) => {}
                Err(err) => self.report_error(&err, None, "channel subscription failed"),
            }
        }
        report.subscribed = self.monitor.is_subscribed();

        if due.refresh_auth && self.session_stale(now) {
            report.auth_refreshed = self.refresh_auth(now).await;
        }

        report.reaped = self.reap(now);
        report.dispatched = self.flush(now);
        self.update_gauges();
        report
    }

    /// Turn a channel notification into a queued handler and flush immediately.
    pub fn handle_notification(&mut self, notification: Notification, now: Instant) {
        if notification.channel != self.settings.channel {
            self.metrics.inc_notification("ignored");
            debug!(channel = %notification.channel, "notification on foreign channel ignored");
            return;
        }

        let handler = ChangeNotice::parse(&notification.payload).and_then(|notice| {
            self.next_handler += 1;
            FileHandler::from_notice(
                HandlerId::new(self.next_handler),
                notice,
                &self.settings.root,
                now,
            )
        });
        match handler {
            Ok(handler) => {
                self.metrics.inc_notification("accepted");
                self.metrics.inc_handler_created();
                debug!(
                    handler = %handler.id(),
                    file_id = %handler.file_id(),
                    operation = %handler.operation(),
                    "handler queued"
                );
                self.queue.push_back(handler.id());
                self.handlers.insert(handler.id(), handler);
            }
            Err(err) => {
                self.metrics.inc_notification("rejected");
                self.report_error(&err, None, "notification rejected");
            }
        }

        self.flush(now);
        self.update_gauges();
    }

    /// Process the next finished task. Returns `false` when none are outstanding.
    pub async fn next_completion(&mut self) -> bool {
        match self.tasks.join_next_with_id().await {
            Some(joined) => {
                self.on_joined(joined, Instant::now());
                true
            }
            None => false,
        }
    }

    /// Process finished tasks until none are outstanding.
    pub async fn settle(&mut self) {
        while self.next_completion().await {}
    }

    /// A held session is reused until it is rejected or reaches its maximum age.
    fn session_stale(&self, now: Instant) -> bool {
        self.session.as_ref().is_none_or(|held| {
            now.saturating_duration_since(held.obtained_at) >= self.settings.session_max_age
        })
    }

    async fn refresh_auth(&mut self, now: Instant) -> bool {
        match self.deps.authenticator.authenticate().await {
            Ok(session) => {
                self.session = Some(HeldSession {
                    session,
                    obtained_at: now,
                });
                true
            }
            Err(err) => {
                self.report_error(&err, None, "authorization refresh failed");
                false
            }
        }
    }

    fn flush(&mut self, now: Instant) -> usize {
        let mut dispatched = 0;
        let mut deferred = VecDeque::with_capacity(self.queue.len());
        let mut blocked: HashSet<FileId> = HashSet::new();

        while let Some(id) = self.queue.pop_front() {
            let Some(handler) = self.handlers.get(&id) else {
                continue;
            };
            let file_id = handler.file_id().clone();
            let operation = handler.operation();

            let busy = self.in_flight.contains(&file_id) || blocked.contains(&file_id);
            if busy {
                deferred.push_back(id);
                blocked.insert(file_id);
                continue;
            }

            if operation == Operation::Delete {
                if let Some(handler) = self.handlers.remove(&id) {
                    self.delete_direct(handler);
                }
                continue;
            }

            let session = match &self.session {
                Some(held) if self.in_flight.len() < self.settings.max_in_flight => {
                    held.session.clone()
                }
                _ => {
                    deferred.push_back(id);
                    blocked.insert(file_id);
                    continue;
                }
            };

            self.dispatch(id, session, now);
            dispatched += 1;
        }

        self.queue = deferred;
        dispatched
    }

    fn dispatch(&mut self, id: HandlerId, session: Session, now: Instant) {
        let Some(handler) = self.handlers.get_mut(&id) else {
            return;
        };
        let file_id = handler.file_id().clone();
        let source = Arc::clone(&self.deps.source);
        let task_file_id = file_id.clone();
        let abort = self.tasks.spawn(async move {
            let result = pipeline::execute(source, session, task_file_id).await;
            TaskOutcome::Query {
                handler: id,
                result,
            }
        });
        self.task_kinds.insert(abort.id(), TaskKind::Query(id));
        handler.mark_querying(abort, now);
        debug!(handler = %id, file_id = %file_id, "query batch submitted");
        self.in_flight.insert(file_id);
    }

    fn delete_direct(&mut self, handler: FileHandler) {
        match Reconciler::delete_direct(&handler) {
            Ok(action) => {
                self.metrics.inc_fs_action("delete");
                info!(
                    file_id = %handler.file_id(),
                    path = %handler.absolute_name.display(),
                    "file deleted"
                );
                self.retire(handler, Retirement::Completed(action.label()));
            }
            Err(err) => {
                self.report_error(&err, Some(&handler), "direct delete failed");
                self.retire(handler, Retirement::Failed);
            }
        }
    }

    fn reap(&mut self, now: Instant) -> usize {
        let timeout = self.settings.handler_timeout;
        let mut expired: Vec<HandlerId> = self
            .handlers
            .iter()
            .filter(|(_, handler)| handler.expired(now, timeout))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        expired.sort_unstable();

        for id in &expired {
            if let Some(handler) = self.handlers.remove(id) {
                handler.abort();
                warn!(
                    handler = %handler.id(),
                    file_id = %handler.file_id(),
                    operation = %handler.operation(),
                    age_ms = u64::try_from(handler.age(now).as_millis()).unwrap_or(u64::MAX),
                    "handler expired"
                );
                self.retire(handler, Retirement::Expired);
            }
        }
        expired.len()
    }

    fn on_joined(&mut self, joined: Result<(TaskId, TaskOutcome), JoinError>, now: Instant) {
        match joined {
            Ok((task_id, outcome)) => {
                self.task_kinds.remove(&task_id);
                self.on_outcome(outcome);
            }
            Err(err) => self.on_task_failure(&err),
        }
        self.flush(now);
        self.update_gauges();
    }

    fn on_task_failure(&mut self, err: &JoinError) {
        let kind = self.task_kinds.remove(&err.id());
        let cancelled = err.is_cancelled();
        match kind {
            Some(TaskKind::Query(id)) => {
                if let Some(handler) = self.handlers.remove(&id) {
                    error!(
                        handler = %id,
                        file_id = %handler.file_id(),
                        cancelled,
                        "query task ended without a result"
                    );
                    self.metrics.inc_pipeline_error("task");
                    self.retire(handler, Retirement::Failed);
                }
            }
            Some(TaskKind::Apply(file_id)) => {
                self.in_flight.remove(&file_id);
                self.metrics.inc_pipeline_error("task");
                self.metrics.inc_handler_retired(Retirement::Failed.label());
                error!(file_id = %file_id, cancelled, "reconciliation task ended without a result");
            }
            Some(TaskKind::Fetch(file_id)) => {
                self.in_flight.remove(&file_id);
                if !cancelled {
                    self.metrics.inc_pipeline_error("task");
                    error!(file_id = %file_id, "fetch task panicked");
                }
            }
            Some(TaskKind::Report) | None => {
                if !cancelled {
                    self.metrics.inc_pipeline_error("task");
                    error!(error = %err, "background task panicked");
                }
            }
        }
    }

    fn on_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Query { handler, result } => self.on_query_complete(handler, result),
            TaskOutcome::Applied { handler, result } => self.on_applied(*handler, result),
            TaskOutcome::Fetch { file_id, result } => {
                self.in_flight.remove(&file_id);
                match result {
                    Ok(bytes) => {
                        self.metrics.inc_fs_action("fetch_write");
                        debug!(file_id = %file_id, bytes, "fetch completed");
                    }
                    Err(err) => {
                        self.metrics.inc_pipeline_error(err.kind());
                        error!(
                            file_id = %file_id,
                            error = ?err,
                            error_kind = err.kind(),
                            "remote fetch failed"
                        );
                    }
                }
            }
            TaskOutcome::Report { file_id, result } => {
                if let Err(err) = result {
                    self.metrics.inc_pipeline_error(err.kind());
                    warn!(
                        file_id = %file_id,
                        error = ?err,
                        error_kind = err.kind(),
                        "completion directive failed"
                    );
                }
            }
        }
    }

    fn on_query_complete(&mut self, id: HandlerId, result: SyncResult<Option<DesiredFileState>>) {
        let Some(handler) = self.handlers.remove(&id) else {
            debug!(handler = %id, "result arrived for retired handler");
            return;
        };

        let desired = match result {
            Ok(Some(desired)) => desired,
            Ok(None) | Err(SyncError::NotFound { .. }) => {
                debug!(file_id = %handler.file_id(), "desired state vanished before fetch");
                self.retire(handler, Retirement::Vanished);
                return;
            }
            Err(err) => {
                if matches!(err, SyncError::Authorization { .. }) {
                    // Rejected sessions are replaced on the next auth tick.
                    self.session = None;
                }
                self.report_error(&err, Some(&handler), "query pipeline failed");
                self.retire(handler, Retirement::Failed);
                return;
            }
        };

        self.spawn_apply(handler, desired);
    }

    fn spawn_apply(&mut self, mut handler: FileHandler, desired: DesiredFileState) {
        let reconciler = Arc::clone(&self.reconciler);
        let file_id = handler.file_id().clone();
        let abort = self.tasks.spawn_blocking(move || {
            let result = reconciler.apply(&mut handler, desired);
            TaskOutcome::Applied {
                handler: Box::new(handler),
                result,
            }
        });
        self.task_kinds.insert(abort.id(), TaskKind::Apply(file_id));
    }

    fn on_applied(&mut self, handler: FileHandler, result: SyncResult<Action>) {
        match result {
            Ok(action) => self.complete(handler, action),
            Err(err) => {
                self.report_error(&err, Some(&handler), "reconciliation failed");
                self.retire(handler, Retirement::Failed);
            }
        }
    }

    fn complete(&mut self, handler: FileHandler, action: Action) {
        let label = action.label();
        match action {
            Action::Written {
                path,
                bytes,
                content_type,
            } => {
                self.metrics.inc_fs_action("write");
                info!(
                    file_id = %handler.file_id(),
                    operation = %handler.operation(),
                    path = %path.display(),
                    bytes,
                    "file written"
                );
                if let Some(directive) = handler.done_action.clone() {
                    self.spawn_report(CompletionReport {
                        directive,
                        file_id: handler.file_id().clone(),
                        outcome: CompletionOutcome::Done {
                            content_type,
                            size: bytes,
                            path,
                        },
                    });
                }
                self.retire(handler, Retirement::Completed(label));
            }
            Action::Deleted { path, existed } => {
                self.metrics.inc_fs_action("delete");
                info!(
                    file_id = %handler.file_id(),
                    path = %path.display(),
                    existed,
                    "previous file removed"
                );
                self.retire(handler, Retirement::Completed(label));
            }
            Action::Fetch(job) => {
                self.metrics.inc_fs_action("fetch");
                info!(
                    file_id = %handler.file_id(),
                    uri = %job.uri,
                    transport = self.fetcher.transport_name(),
                    "remote fetch dispatched"
                );
                self.spawn_fetch(job);
                self.retire(handler, Retirement::FetchDispatched);
            }
            Action::NoOp(reason) => {
                debug!(file_id = %handler.file_id(), reason = reason.label(), "nothing to do");
                self.retire(handler, Retirement::Completed(label));
            }
        }
    }

    fn spawn_fetch(&mut self, job: FetchJob) {
        let fetcher = Arc::clone(&self.fetcher);
        let file_id = job.file_id.clone();
        let task_file_id = file_id.clone();
        let abort = self.tasks.spawn(async move {
            let result = fetcher.run(job).await;
            TaskOutcome::Fetch {
                file_id: task_file_id,
                result,
            }
        });
        self.task_kinds.insert(abort.id(), TaskKind::Fetch(file_id));
    }

    fn spawn_report(&mut self, report: CompletionReport) {
        let sink = Arc::clone(&self.deps.sink);
        let file_id = report.file_id.clone();
        let abort = self.tasks.spawn(async move {
            let result = sink.report(report).await;
            TaskOutcome::Report { file_id, result }
        });
        self.task_kinds.insert(abort.id(), TaskKind::Report);
    }

    /// Consume the handler. A dispatched fetch keeps the file id in flight
    /// until the fetch task finishes.
    fn retire(&mut self, handler: FileHandler, retirement: Retirement) {
        if handler.is_querying() && !matches!(retirement, Retirement::FetchDispatched) {
            self.in_flight.remove(handler.file_id());
        }
        self.metrics.inc_handler_retired(retirement.label());
        debug!(
            handler = %handler.id(),
            file_id = %handler.file_id(),
            outcome = retirement.label(),
            "handler retired"
        );
    }

    fn report_error(&self, err: &SyncError, handler: Option<&FileHandler>, context: &'static str) {
        self.metrics.inc_pipeline_error(err.kind());
        match handler {
            Some(handler) => error!(
                file_id = %handler.file_id(),
                operation = %handler.operation(),
                error = ?err,
                error_kind = err.kind(),
                "{context}"
            ),
            None => error!(error = ?err, error_kind = err.kind(), "{context}"),
        }
    }

    fn update_gauges(&self) {
        self.metrics.set_queue_depth(self.queue.len());
        self.metrics.set_in_flight(self.in_flight.len());
    }

    fn shutdown(mut self) {
        self.tasks.abort_all();
        for handler in self.handlers.values() {
            warn!(
                handler = %handler.id(),
                file_id = %handler.file_id(),
                operation = %handler.operation(),
                "handler abandoned at shutdown"
            );
        }
        self.monitor.reset();
        info!(abandoned = self.handlers.len(), "reconciliation engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAuth, FakeStore, FakeSubscriber, FakeTransport, RecordingSink};
    use anyhow::Result;
    use pgfile_core::{FetchedBody, FileRow};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Harness {
        engine: SyncEngine,
        store: Arc<FakeStore>,
        auth: Arc<FakeAuth>,
        subscriber: Arc<FakeSubscriber>,
        sink: Arc<RecordingSink>,
        transport: Arc<FakeTransport>,
        dir: TempDir,
    }

    impl Harness {
        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn metrics(&self) -> &Metrics {
            self.engine.metrics()
        }
    }

    fn settings(root: &Path) -> EngineSettings {
        EngineSettings {
            channel: "file".into(),
            root: root.to_path_buf(),
            dir_mode: 0o755,
            file_mode: 0o644,
            tick: Duration::from_millis(10),
            listen_check: Duration::from_secs(30),
            auth_refresh: Duration::from_secs(5),
            session_max_age: Duration::from_secs(300),
            handler_timeout: Duration::from_secs(60),
            max_in_flight: 16,
        }
    }

    fn harness() -> Result<Harness> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(FakeStore::default());
        let auth = Arc::new(FakeAuth::default());
        let subscriber = Arc::new(FakeSubscriber::default());
        let sink = Arc::new(RecordingSink::default());
        let transport = Arc::new(FakeTransport::default());
        let deps = EngineDeps {
            source: store.clone(),
            authenticator: auth.clone(),
            subscriber: subscriber.clone(),
            sink: sink.clone(),
            transport: transport.clone(),
        };
        let engine = SyncEngine::new(settings(dir.path()), deps, Metrics::new()?);
        Ok(Harness {
            engine,
            store,
            auth,
            subscriber,
            sink,
            transport,
            dir,
        })
    }

    fn notice(id: &str, operation: &str, path: &str, name: &str, hash: &str) -> Notification {
        Notification {
            channel: "file".into(),
            payload: format!(
                r#"{{"id":"{id}","operation":"{operation}","path":"{path}","name":"{name}","hash":"{hash}"}}"#
            ),
        }
    }

    fn row(kind: &str, path: &str, name: &str, hash: &str, data: &str) -> FileRow {
        FileRow {
            kind: Some(kind.into()),
            path: Some(path.into()),
            name: Some(name.into()),
            hash: Some(hash.into()),
            mime: Some("text/plain".into()),
            data: Some(data.into()),
            done: Some("api.file_done".into()),
            fail: Some("api.file_fail".into()),
        }
    }

    fn seed(root: &Path, relative: &str, content: &[u8]) -> Result<()> {
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, content)?;
        Ok(())
    }

    #[tokio::test]
    async fn insert_writes_decoded_content_and_reports_done() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));

        let report = h.engine.tick(Instant::now()).await;
        assert!(report.subscribed && report.auth_refreshed);

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;

        assert_eq!(fs::read(h.root().join("docs/a.txt"))?, b"hello");
        let reports = h.sink.reports();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0].outcome,
            CompletionOutcome::Done { size: 5, content_type: Some(ct), .. } if ct == "text/plain"
        ));
        assert_eq!(h.metrics().handlers_retired("written"), 1);
        assert_eq!(h.engine.pending(), 0);
        assert_eq!(h.engine.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_update_with_same_hash_writes_nothing() -> Result<()> {
        let mut h = harness()?;
        seed(h.root(), "docs/a.txt", b"original")?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));
        h.engine.tick(Instant::now()).await;

        for _ in 0..3 {
            h.engine
                .handle_notification(notice("7", "UPDATE", "/docs", "a.txt", "h1"), Instant::now());
            h.engine.settle().await;
        }

        assert_eq!(fs::read(h.root().join("docs/a.txt"))?, b"original");
        assert_eq!(h.metrics().fs_actions("write"), 0);
        assert_eq!(h.metrics().handlers_retired("unchanged"), 3);
        assert!(h.sink.reports().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn update_to_new_path_moves_the_file() -> Result<()> {
        let mut h = harness()?;
        seed(h.root(), "a/x.txt", b"old")?;
        h.store.put("7", row("-", "/b", "x.txt", "h1", "bmV3"));
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "UPDATE", "/a", "x.txt", "h1"), Instant::now());
        h.engine.settle().await;

        assert!(!h.root().join("a/x.txt").exists());
        assert_eq!(fs::read(h.root().join("b/x.txt"))?, b"new");
        Ok(())
    }

    #[tokio::test]
    async fn tombstone_removes_old_path_and_writes_nothing() -> Result<()> {
        let mut h = harness()?;
        seed(h.root(), "a/x.txt", b"old")?;
        h.store.put("7", row("s", "/c", "x.txt", "h2", "eA=="));
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "UPDATE", "/a", "x.txt", "h1"), Instant::now());
        h.engine.settle().await;

        assert!(!h.root().join("a/x.txt").exists());
        assert!(!h.root().join("c/x.txt").exists());
        assert_eq!(h.metrics().handlers_retired("deleted"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_row_retires_without_error() -> Result<()> {
        let mut h = harness()?;
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;

        assert_eq!(h.metrics().handlers_retired("vanished"), 1);
        assert_eq!(h.metrics().snapshot().handlers_retired_total, 1);
        assert!(!h.root().join("docs").exists());
        assert!(h.sink.reports().is_empty());
        for kind in ["authorization", "transport", "not_found"] {
            assert_eq!(h.metrics().pipeline_errors(kind), 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn rejected_authorization_touches_nothing() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));
        h.store.deny("session expired");
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;

        assert_eq!(h.metrics().pipeline_errors("authorization"), 1);
        assert_eq!(h.metrics().handlers_retired("failed"), 1);
        assert!(!h.root().join("docs/a.txt").exists());
        assert!(h.sink.reports().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_type_marker_fails_without_touching_disk() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("x", "/docs", "a.txt", "h1", "aGVsbG8="));
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;

        assert_eq!(h.metrics().pipeline_errors("invalid_row"), 1);
        assert_eq!(h.metrics().handlers_retired("failed"), 1);
        assert_eq!(h.engine.in_flight(), 0);
        assert_eq!(h.engine.pending(), 0);
        assert!(!h.root().join("docs").exists());
        assert!(h.sink.reports().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_payload_fails_without_writing() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "!!!"));
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;

        assert_eq!(h.metrics().pipeline_errors("decode"), 1);
        assert_eq!(h.metrics().handlers_retired("failed"), 1);
        assert_eq!(h.metrics().fs_actions("write"), 0);
        assert_eq!(h.engine.in_flight(), 0);
        assert!(!h.root().join("docs/a.txt").exists());
        assert!(h.sink.reports().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn session_is_reused_until_rejected_or_aged_out() -> Result<()> {
        let mut h = harness()?;
        let start = Instant::now();
        assert!(h.engine.tick(start).await.auth_refreshed);

        let reused = h.engine.tick(start + Duration::from_secs(5)).await;
        assert!(!reused.auth_refreshed);
        assert_eq!(h.auth.calls(), 1);

        h.store.deny("session expired");
        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;
        assert_eq!(h.metrics().pipeline_errors("authorization"), 1);
        assert!(!h.engine.has_session());

        h.store.allow();
        let replaced = h.engine.tick(start + Duration::from_secs(10)).await;
        assert!(replaced.auth_refreshed);
        assert_eq!(h.auth.calls(), 2);

        let aged = h.engine.tick(start + Duration::from_secs(310)).await;
        assert!(aged.auth_refreshed);
        assert_eq!(h.auth.calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_retires_handler() -> Result<()> {
        let mut h = harness()?;
        h.store.break_transport();
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine.settle().await;

        assert_eq!(h.metrics().pipeline_errors("transport"), 1);
        assert_eq!(h.metrics().handlers_retired("failed"), 1);
        assert_eq!(h.engine.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn delete_never_queries_the_store() -> Result<()> {
        let mut h = harness()?;
        seed(h.root(), "docs/a.txt", b"bye")?;

        // No tick yet: no session and no subscription.
        h.engine
            .handle_notification(notice("7", "DELETE", "/docs", "a.txt", "h1"), Instant::now());

        assert!(!h.root().join("docs/a.txt").exists());
        assert!(h.store.calls().is_empty());
        assert_eq!(h.metrics().handlers_retired("deleted"), 1);
        assert_eq!(h.engine.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn same_file_updates_run_one_at_a_time() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine
            .handle_notification(notice("8", "INSERT", "/docs", "b.txt", ""), Instant::now());

        assert_eq!(h.engine.queued(), 1);
        assert_eq!(h.engine.in_flight(), 2);

        h.engine.settle().await;
        assert_eq!(h.store.calls().len(), 3);
        assert_eq!(h.metrics().handlers_retired("written"), 2);
        assert_eq!(h.metrics().handlers_retired("vanished"), 1);
        assert_eq!(h.engine.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn delete_waits_behind_inflight_update_for_same_file() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine
            .handle_notification(notice("7", "DELETE", "/docs", "a.txt", "h1"), Instant::now());
        assert_eq!(h.engine.queued(), 1);

        h.engine.settle().await;
        assert!(!h.root().join("docs/a.txt").exists());
        assert_eq!(h.metrics().handlers_retired("written"), 1);
        assert_eq!(h.metrics().handlers_retired("deleted"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stuck_handlers_are_reaped_exactly_once() -> Result<()> {
        let mut h = harness()?;
        h.store.hang();
        let start = Instant::now();
        h.engine.tick(start).await;

        h.engine
            .handle_notification(notice("7", "UPDATE", "/docs", "a.txt", "h1"), start);
        h.engine
            .handle_notification(notice("7", "UPDATE", "/docs", "a.txt", "h1"), start);
        assert_eq!(h.engine.in_flight(), 1);
        assert_eq!(h.engine.queued(), 1);

        let early = h.engine.tick(start + Duration::from_secs(30)).await;
        assert_eq!(early.reaped, 0);

        let late = h.engine.tick(start + Duration::from_secs(61)).await;
        assert_eq!(late.reaped, 1);
        assert_eq!(late.dispatched, 1);

        h.store.resume();
        h.engine.settle().await;

        // The queued duplicate outlived the timeout but was never dispatched, so it still ran.
        let snapshot = h.metrics().snapshot();
        assert_eq!(snapshot.handlers_created_total, 2);
        assert_eq!(snapshot.handlers_retired_total, 2);
        assert_eq!(h.metrics().handlers_retired("expired"), 1);
        assert_eq!(h.metrics().handlers_retired("vanished"), 1);
        assert_eq!(h.engine.pending(), 0);
        assert_eq!(h.engine.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn update_queued_behind_held_fetch_outlives_the_timeout() -> Result<()> {
        let mut h = harness()?;
        let url = "https://files.example.test/x.txt";
        h.store.put(
            "7",
            row("l", "/docs", "x.txt", "h1", "aHR0cHM6Ly9maWxlcy5leGFtcGxlLnRlc3QveC50eHQ="),
        );
        h.transport.respond(
            url,
            Ok(FetchedBody {
                bytes: b"remote".to_vec(),
                content_type: None,
            }),
        );
        h.transport.hold();
        let start = Instant::now();
        h.engine.tick(start).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "x.txt", ""), start);
        while h.metrics().handlers_retired("fetch_dispatched") == 0 {
            assert!(h.engine.next_completion().await);
        }
        h.engine
            .handle_notification(notice("7", "UPDATE", "/docs", "x.txt", "h1"), start);
        assert_eq!(h.engine.queued(), 1);

        let late = h.engine.tick(start + Duration::from_secs(61)).await;
        assert_eq!(late.reaped, 0);
        assert_eq!(h.engine.queued(), 1);

        h.transport.release();
        h.engine.settle().await;

        assert_eq!(h.store.calls().len(), 2);
        assert_eq!(h.metrics().handlers_retired("expired"), 0);
        assert_eq!(h.metrics().handlers_retired("fetch_dispatched"), 2);
        assert_eq!(h.engine.pending(), 0);
        assert_eq!(h.engine.in_flight(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn handlers_wait_for_a_session() -> Result<()> {
        let mut h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));
        h.auth.fail(true);
        let start = Instant::now();
        let first = h.engine.tick(start).await;
        assert!(!first.auth_refreshed);
        assert!(!h.engine.has_session());

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "a.txt", ""), start);
        assert_eq!(h.engine.queued(), 1);
        assert!(h.store.calls().is_empty());

        h.auth.fail(false);
        let second = h.engine.tick(start + Duration::from_secs(5)).await;
        assert!(second.auth_refreshed);
        assert_eq!(second.dispatched, 1);
        h.engine.settle().await;

        assert_eq!(fs::read(h.root().join("docs/a.txt"))?, b"hello");
        assert_eq!(h.auth.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_cap_defers_excess_handlers() -> Result<()> {
        let mut h = harness()?;
        h.engine.settings.max_in_flight = 1;
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("1", "INSERT", "/docs", "a.txt", ""), Instant::now());
        h.engine
            .handle_notification(notice("2", "INSERT", "/docs", "b.txt", ""), Instant::now());
        assert_eq!(h.engine.in_flight(), 1);
        assert_eq!(h.engine.queued(), 1);

        h.engine.settle().await;
        assert_eq!(h.store.calls().len(), 2);
        assert_eq!(h.metrics().handlers_retired("vanished"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn lost_subscription_is_restored_on_next_tick() -> Result<()> {
        let mut h = harness()?;
        h.subscriber.fail_next(1);
        let start = Instant::now();

        let first = h.engine.tick(start).await;
        assert!(!first.subscribed);
        assert_eq!(h.metrics().pipeline_errors("subscription"), 1);

        let second = h.engine.tick(start + Duration::from_secs(1)).await;
        assert!(!second.listen_checked);
        assert!(second.subscribed);
        assert_eq!(h.subscriber.subscribe_count(), 1);

        h.subscriber.set_listening(false);
        let probe = h.engine.tick(start + Duration::from_secs(31)).await;
        assert!(probe.listen_checked && probe.subscribed);
        assert_eq!(h.subscriber.subscribe_count(), 2);
        assert_eq!(h.metrics().snapshot().subscriptions_total, 2);
        Ok(())
    }

    #[tokio::test]
    async fn link_rows_are_fetched_while_holding_the_file() -> Result<()> {
        let mut h = harness()?;
        let url = "https://files.example.test/x.txt";
        // base64 of the URL above
        h.store.put(
            "7",
            row("l", "/docs", "x.txt", "h1", "aHR0cHM6Ly9maWxlcy5leGFtcGxlLnRlc3QveC50eHQ="),
        );
        h.transport.respond(
            url,
            Ok(FetchedBody {
                bytes: b"remote".to_vec(),
                content_type: Some("text/plain".into()),
            }),
        );
        h.transport.hold();
        h.engine.tick(Instant::now()).await;

        h.engine
            .handle_notification(notice("7", "INSERT", "/docs", "x.txt", ""), Instant::now());
        while h.metrics().handlers_retired("fetch_dispatched") == 0 {
            assert!(h.engine.next_completion().await);
        }
        assert_eq!(h.engine.in_flight(), 1);

        h.engine
            .handle_notification(notice("7", "UPDATE", "/docs", "x.txt", "h1"), Instant::now());
        assert_eq!(h.engine.queued(), 1);
        assert_eq!(h.store.calls().len(), 1);

        h.transport.release();
        h.engine.settle().await;

        // Links are re-fetched on every pass; the update only starts after the first fetch.
        assert_eq!(fs::read(h.root().join("docs/x.txt"))?, b"remote");
        assert_eq!(h.transport.calls(), 2);
        assert_eq!(h.store.calls().len(), 2);
        assert_eq!(h.metrics().handlers_retired("fetch_dispatched"), 2);
        assert_eq!(h.metrics().fs_actions("fetch_write"), 2);
        let done = h
            .sink
            .reports()
            .into_iter()
            .filter(|report| matches!(report.outcome, CompletionOutcome::Done { .. }))
            .count();
        assert_eq!(done, 2);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_and_malformed_notifications_create_no_handlers() -> Result<()> {
        let mut h = harness()?;
        h.engine.handle_notification(
            Notification {
                channel: "other".into(),
                payload: r#"{"id":"7","operation":"INSERT"}"#.into(),
            },
            Instant::now(),
        );
        h.engine.handle_notification(
            Notification {
                channel: "file".into(),
                payload: "not json".into(),
            },
            Instant::now(),
        );
        h.engine
            .handle_notification(notice("7", "INSERT", "/../etc", "passwd", ""), Instant::now());

        assert_eq!(h.metrics().notifications("ignored"), 1);
        assert_eq!(h.metrics().notifications("rejected"), 2);
        assert_eq!(h.metrics().pipeline_errors("invalid_path"), 1);
        assert_eq!(h.metrics().snapshot().handlers_created_total, 0);
        assert_eq!(h.engine.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn run_loop_consumes_channel_until_shutdown() -> Result<()> {
        let h = harness()?;
        h.store.put("7", row("-", "/docs", "a.txt", "h1", "aGVsbG8="));
        let metrics = h.engine.metrics().clone();
        let root = h.root().to_path_buf();
        let subscriber = h.subscriber.clone();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let running = tokio::spawn(h.engine.run(async {
            let _ = stopped.await;
        }));

        tokio::time::timeout(Duration::from_secs(5), async {
            while subscriber.subscribe_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        let published = subscriber.publish(
            "file",
            r#"{"id":"7","operation":"INSERT","path":"/docs","name":"a.txt"}"#,
        );
        assert!(published);

        let target = root.join("docs/a.txt");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !target.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        let _ = stop.send(());
        running.await?;
        assert_eq!(fs::read(&target)?, b"hello");
        assert_eq!(metrics.handlers_retired("written"), 1);
        drop(h.dir);
        Ok(())
    }
}
