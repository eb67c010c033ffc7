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

//! Shared domain types for pgfile.
//!
//! Layout: `model.rs` (file identity, change notices, desired state rows),
//! `ports.rs` (collaborator traits implemented by the data layer and fakes),
//! `error.rs` (`SyncError` taxonomy).

pub mod error;
pub mod model;
pub mod ports;

pub use error::{SyncError, SyncResult};
pub use model::{
    AuthorizeRow, BatchResults, ChangeNotice, CompletionOutcome, CompletionReport,
    DesiredFileState, Directive, FileId, FileKind, FileRow, Notification, Operation, Session,
};
pub use ports::{
    Authenticator, CompletionSink, FetchTransport, FetchedBody, FileStateSource,
    NotificationSource, NotificationSubscriber,
};
