#![forbid(unsafe_code)]
#![warn(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! Reconciliation engine that keeps a directory tree in step with declared
//! file rows, driven by change notifications.
//!
//! Layout: `handler.rs` (per-event state), `paths.rs` (root-relative path
//! resolution and atomic writes), `pipeline.rs` (batch interpretation),
//! `reconcile.rs` (filesystem decisions), `fetch.rs` (remote fetch transports
//! and dispatcher), `monitor.rs` (channel subscription), `heartbeat.rs`
//! (tick cadence), `engine.rs` (the event loop composing them).

pub mod engine;
pub mod fetch;
pub mod handler;
pub mod heartbeat;
pub mod monitor;
pub mod paths;
pub mod pipeline;
pub mod reconcile;

#[cfg(test)]
mod testing;

pub use engine::{EngineDeps, EngineSettings, SyncEngine, TickReport};
pub use fetch::{CurlTransport, FetchJob, RemoteFetcher, ReqwestTransport};
pub use handler::{FileHandler, HandlerId, HandlerState};
pub use heartbeat::{HeartbeatDue, HeartbeatSchedule};
pub use monitor::{ChannelMonitor, SubscriptionStatus};
pub use reconcile::{Action, NoOpReason, Reconciler};
