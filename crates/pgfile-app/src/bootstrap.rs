use std::future::Future;
use std::sync::Arc;

use pgfile_config::{FetchTransportKind, FilesConfig, LogFormatKind, MODULE_SECTION, SyncConfig};
use pgfile_core::FetchTransport;
use pgfile_data::{PgAuthenticator, PgFileStore, PgSubscriber};
use pgfile_sync::{CurlTransport, EngineDeps, EngineSettings, ReqwestTransport, SyncEngine};
use pgfile_telemetry::{LogFormat, LogSettings, Metrics};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Entry point for the pgfile boot sequence.
///
/// # Errors
///
/// Returns an error if configuration, logging, the database pool, or the
/// fetch transport cannot be set up.
pub async fn run_app() -> AppResult<()> {
    let config =
        pgfile_config::load_from_env().map_err(|err| AppError::config("config.load", err))?;
    pgfile_telemetry::init_logging(&logging_config(&config))
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    run_with(config, shutdown_signal()).await
}

/// Boot sequence over an already-loaded configuration.
pub(crate) async fn run_with<F>(config: SyncConfig, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    info!(build_sha = pgfile_telemetry::build_sha(), "pgfile bootstrap starting");
    if !config.module_enabled(MODULE_SECTION) {
        info!(section = MODULE_SECTION, "module disabled; nothing to do");
        return Ok(());
    }

    let settings = EngineSettings::from_config(&config)
        .map_err(|err| AppError::config("engine.settings", err))?;
    let transport = build_transport(&config.files)?;
    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|err| AppError::database("database.connect", err))?;
    info!(
        max_connections = config.database.max_connections,
        "database pool ready"
    );

    let store = Arc::new(PgFileStore::new(pool.clone()));
    let deps = EngineDeps {
        source: store.clone(),
        authenticator: Arc::new(PgAuthenticator::new(
            pool.clone(),
            config.auth.client_id.clone(),
            config.auth.client_secret.clone(),
        )),
        subscriber: Arc::new(PgSubscriber::new(pool.clone())),
        sink: store,
        transport,
    };

    SyncEngine::new(settings, deps, metrics.clone())
        .run(shutdown)
        .await;

    pool.close().await;
    info!(metrics = ?metrics.snapshot(), "pgfile shutdown complete");
    Ok(())
}

fn logging_config(config: &SyncConfig) -> LogSettings<'_> {
    let format = match config.logging.format {
        Some(LogFormatKind::Json) => LogFormat::Json,
        Some(LogFormatKind::Pretty) => LogFormat::Pretty,
        None => LogFormat::infer(),
    };
    LogSettings {
        level: &config.logging.level,
        format,
        // Per-module directives are only useful when events carry their target.
        with_targets: config.logging.level.contains('='),
        build_sha: option_env!("PGFILE_BUILD_SHA").unwrap_or("dev"),
    }
}

fn build_transport(files: &FilesConfig) -> AppResult<Arc<dyn FetchTransport>> {
    let transport: Arc<dyn FetchTransport> = match files.transport {
        FetchTransportKind::Fetch => Arc::new(
            ReqwestTransport::new(files.fetch_timeout())
                .map_err(|err| AppError::engine("transport.build", err))?,
        ),
        FetchTransportKind::Curl => Arc::new(CurlTransport::new(
            files.curl_binary.clone(),
            files.fetch_timeout(),
        )),
    };
    info!(transport = transport.name(), "fetch transport selected");
    Ok(transport)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
