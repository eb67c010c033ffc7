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

//! Typed configuration for the pgfile daemon.
//!
//! Layout: `model.rs` (configuration sections), `defaults.rs` (built-in
//! values), `loader.rs` (YAML + environment overrides), `validate.rs`
//! (structural checks), `error.rs` (`ConfigError`).

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use defaults::MODULE_SECTION;
pub use error::{ConfigError, ConfigResult};
pub use loader::{CONFIG_PATH_ENV, load_config, load_from_env};
pub use model::{
    AuthConfig, DatabaseConfig, FetchTransportKind, FilesConfig, HeartbeatConfig, LogFormatKind,
    LoggingSection, ModuleSection, SyncConfig,
};
