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

//! pgfile application bootstrap wiring.
//!
//! Layout: `bootstrap.rs` (configuration, logging, port wiring, signal
//! handling), `error.rs` (`AppError`).

/// Application bootstrap and environment loading.
pub mod bootstrap;
pub mod error;

pub use bootstrap::run_app;
pub use error::{AppError, AppResult};
