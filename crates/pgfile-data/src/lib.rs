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

//! PostgreSQL data access for pgfile: the authorize/fetch batch, session login,
//! completion directives, and the LISTEN subscription.
//!
//! Layout: `store.rs` (batch + directives), `auth.rs` (login), `listener.rs`
//! (channel subscription), `error.rs` (`DataError`).

pub mod auth;
pub mod error;
pub mod listener;
pub mod store;

pub use auth::PgAuthenticator;
pub use error::{DataError, Result as DataResult};
pub use listener::{PgNotificationSource, PgSubscriber};
pub use store::PgFileStore;
