//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters/gauges that describe handler lifecycles and channel health.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across the engine.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    notifications_total: IntCounterVec,
    handlers_created_total: IntCounter,
    handlers_retired_total: IntCounterVec,
    handlers_retired_sum: IntCounter,
    fs_actions_total: IntCounterVec,
    pipeline_errors_total: IntCounterVec,
    subscriptions_total: IntCounter,
    queue_depth: IntGauge,
    in_flight: IntGauge,
}

/// Snapshot of the most relevant counters and gauges.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Handlers created from notifications.
    pub handlers_created_total: u64,
    /// Handlers retired across every outcome.
    pub handlers_retired_total: u64,
    /// Subscriptions established on the notification channel.
    pub subscriptions_total: u64,
    /// Handlers waiting for dispatch.
    pub queue_depth: i64,
    /// File identifiers with an outstanding query or fetch.
    pub in_flight: i64,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let notifications_total = counter_vec(
            "pgfile_notifications_total",
            "Channel notifications by outcome",
            &["outcome"],
        )?;
        let handlers_created_total = counter(
            "pgfile_handlers_created_total",
            "File handlers created from notifications",
        )?;
        let handlers_retired_total = counter_vec(
            "pgfile_handlers_retired_total",
            "File handlers retired by terminal outcome",
            &["outcome"],
        )?;
        let handlers_retired_sum = counter(
            "pgfile_handlers_retired_sum",
            "File handlers retired across every outcome",
        )?;
        let fs_actions_total = counter_vec(
            "pgfile_fs_actions_total",
            "Filesystem and fetch actions performed",
            &["action"],
        )?;
        let pipeline_errors_total = counter_vec(
            "pgfile_pipeline_errors_total",
            "Errors reported by the reconciliation pipeline",
            &["kind"],
        )?;
        let subscriptions_total = counter(
            "pgfile_subscriptions_total",
            "Notification channel subscriptions established",
        )?;
        let queue_depth = gauge("pgfile_queue_depth", "Handlers waiting for dispatch")?;
        let in_flight = gauge(
            "pgfile_in_flight",
            "File identifiers with an outstanding operation",
        )?;

        register(&registry, "pgfile_notifications_total", &notifications_total)?;
        register(&registry, "pgfile_handlers_created_total", &handlers_created_total)?;
        register(&registry, "pgfile_handlers_retired_total", &handlers_retired_total)?;
        register(&registry, "pgfile_handlers_retired_sum", &handlers_retired_sum)?;
        register(&registry, "pgfile_fs_actions_total", &fs_actions_total)?;
        register(&registry, "pgfile_pipeline_errors_total", &pipeline_errors_total)?;
        register(&registry, "pgfile_subscriptions_total", &subscriptions_total)?;
        register(&registry, "pgfile_queue_depth", &queue_depth)?;
        register(&registry, "pgfile_in_flight", &in_flight)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                notifications_total,
                handlers_created_total,
                handlers_retired_total,
                handlers_retired_sum,
                fs_actions_total,
                pipeline_errors_total,
                subscriptions_total,
                queue_depth,
                in_flight,
            }),
        })
    }

    /// Count a received notification by outcome (`accepted`, `rejected`, `ignored`).
    pub fn inc_notification(&self, outcome: &str) {
        self.inner
            .notifications_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count a created handler.
    pub fn inc_handler_created(&self) {
        self.inner.handlers_created_total.inc();
    }

    /// Count a retired handler by outcome.
    pub fn inc_handler_retired(&self, outcome: &str) {
        self.inner
            .handlers_retired_total
            .with_label_values(&[outcome])
            .inc();
        self.inner.handlers_retired_sum.inc();
    }

    /// Count a filesystem or fetch action.
    pub fn inc_fs_action(&self, action: &str) {
        self.inner.fs_actions_total.with_label_values(&[action]).inc();
    }

    /// Count a pipeline error by kind.
    pub fn inc_pipeline_error(&self, kind: &str) {
        self.inner
            .pipeline_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Count an established subscription.
    pub fn inc_subscription(&self) {
        self.inner.subscriptions_total.inc();
    }

    /// Set the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.queue_depth.set(clamp_i64(depth));
    }

    /// Set the in-flight gauge.
    pub fn set_in_flight(&self, count: usize) {
        self.inner.in_flight.set(clamp_i64(count));
    }

    /// Retired handler count for a single outcome label.
    #[must_use]
    pub fn handlers_retired(&self, outcome: &str) -> u64 {
        self.inner
            .handlers_retired_total
            .with_label_values(&[outcome])
            .get()
    }

    /// Action count for a single action label.
    #[must_use]
    pub fn fs_actions(&self, action: &str) -> u64 {
        self.inner.fs_actions_total.with_label_values(&[action]).get()
    }

    /// Error count for a single error kind.
    #[must_use]
    pub fn pipeline_errors(&self, kind: &str) -> u64 {
        self.inner
            .pipeline_errors_total
            .with_label_values(&[kind])
            .get()
    }

    /// Notification count for a single outcome label.
    #[must_use]
    pub fn notifications(&self, outcome: &str) -> u64 {
        self.inner
            .notifications_total
            .with_label_values(&[outcome])
            .get()
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(TelemetryError::render)?;
        String::from_utf8(buffer).map_err(TelemetryError::render)
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handlers_created_total: self.inner.handlers_created_total.get(),
            handlers_retired_total: self.inner.handlers_retired_sum.get(),
            subscriptions_total: self.inner.subscriptions_total.get(),
            queue_depth: self.inner.queue_depth.get(),
            in_flight: self.inner.in_flight.get(),
        }
    }
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::collector("build", name, source))
}

fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::collector("build", name, source))
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::collector("build", name, source))
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::collector("register", name, source))
}

fn clamp_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
