//! Remote fetch dispatch for link rows that resolve to an HTTP(S) URL.
//!
//! # Design
//! - Two interchangeable transports behind `FetchTransport`: an in-process
//!   `reqwest` client and the `curl` binary.
//! - The dispatcher owns the whole continuation: fetch, atomic write, then
//!   the done or fail directive.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pgfile_core::{
    CompletionOutcome, CompletionReport, CompletionSink, Directive, FetchTransport, FetchedBody,
    FileId, SyncError, SyncResult,
};
use reqwest::header::CONTENT_TYPE;
use tokio::process::Command;
use tracing::{info, warn};

use crate::paths;

/// Everything the dispatcher needs to finish a link reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    /// Row the fetch belongs to.
    pub file_id: FileId,
    /// Remote URL.
    pub uri: String,
    /// Destination on disk.
    pub absolute_name: PathBuf,
    /// Directive reported after a successful write.
    pub done_action: Option<Directive>,
    /// Directive reported when the fetch or write fails.
    pub fail_action: Option<Directive>,
}

/// Runs fetch jobs to completion and reports their outcome upstream.
pub struct RemoteFetcher {
    transport: Arc<dyn FetchTransport>,
    sink: Arc<dyn CompletionSink>,
    file_mode: u32,
}

impl RemoteFetcher {
    /// Build a dispatcher over `transport`, reporting through `sink`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn FetchTransport>,
        sink: Arc<dyn CompletionSink>,
        file_mode: u32,
    ) -> Self {
        Self {
            transport,
            sink,
            file_mode,
        }
    }

    /// Label of the active transport.
    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Fetch, write, and report. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the fetch or write error after the fail directive (if any)
    /// has been reported.
    pub async fn run(&self, job: FetchJob) -> SyncResult<u64> {
        let written = self.fetch_and_write(&job).await;
        match &written {
            Ok((size, content_type)) => {
                info!(
                    file_id = %job.file_id,
                    uri = %job.uri,
                    path = %job.absolute_name.display(),
                    size,
                    transport = self.transport.name(),
                    "remote content written"
                );
                if let Some(directive) = job.done_action.clone() {
                    self.report(CompletionReport {
                        directive,
                        file_id: job.file_id.clone(),
                        outcome: CompletionOutcome::Done {
                            content_type: content_type.clone(),
                            size: *size,
                            path: job.absolute_name.clone(),
                        },
                    })
                    .await;
                }
            }
            Err(err) => {
                if let Some(directive) = job.fail_action.clone() {
                    self.report(CompletionReport {
                        directive,
                        file_id: job.file_id.clone(),
                        outcome: CompletionOutcome::Failed {
                            message: describe(err),
                        },
                    })
                    .await;
                }
            }
        }
        written.map(|(size, _)| size)
    }

    async fn fetch_and_write(&self, job: &FetchJob) -> SyncResult<(u64, Option<String>)> {
        let body = self.transport.fetch(&job.uri).await?;
        let target = job.absolute_name.clone();
        let mode = self.file_mode;
        let bytes = body.bytes;
        let size = tokio::task::spawn_blocking(move || paths::write_atomic(&target, &bytes, mode))
            .await
            .map_err(|err| {
                SyncError::io("fetch.write", job.absolute_name.clone(), io::Error::other(err))
            })??;
        Ok((size, body.content_type))
    }

    async fn report(&self, report: CompletionReport) {
        let file_id = report.file_id.clone();
        let directive = report.directive.clone();
        if let Err(err) = self.sink.report(report).await {
            warn!(
                file_id = %file_id,
                directive = %directive,
                error = %err,
                error_kind = err.kind(),
                "completion directive failed"
            );
        }
    }
}

fn describe(error: &SyncError) -> String {
    match error {
        SyncError::Fetch {
            url,
            reason,
            detail,
        } => detail.as_ref().map_or_else(
            || format!("{reason}: {url}"),
            |detail| format!("{reason}: {url}: {detail}"),
        ),
        SyncError::Io {
            operation,
            path,
            source,
        } => format!("{operation}: {}: {source}", path.display()),
        other => other.to_string(),
    }
}

/// In-process HTTP transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::transport("build http client", err))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchTransport for ReqwestTransport {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn fetch(&self, url: &str) -> SyncResult<FetchedBody> {
        let fetch_error = |reason: &'static str, err: &reqwest::Error| SyncError::Fetch {
            url: url.to_string(),
            reason,
            detail: Some(err.to_string()),
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| fetch_error("request_failed", &err))?;
        let response = response
            .error_for_status()
            .map_err(|err| fetch_error("http_status", &err))?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| fetch_error("body_read", &err))?;
        Ok(FetchedBody {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Transport that shells out to the `curl` binary.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    binary: PathBuf,
    timeout: Duration,
}

impl CurlTransport {
    /// Use `binary` with a per-request `timeout`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(&self, url: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(["--silent", "--show-error", "--fail", "--location"])
            .arg("--max-time")
            .arg(self.timeout.as_secs().max(1).to_string())
            .args(["--write-out", "%{stderr}%{content_type}"])
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl FetchTransport for CurlTransport {
    fn name(&self) -> &'static str {
        "curl"
    }

    async fn fetch(&self, url: &str) -> SyncResult<FetchedBody> {
        let output = self
            .command(url)
            .output()
            .await
            .map_err(|source| SyncError::io("curl.spawn", &self.binary, source))?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(SyncError::Fetch {
                url: url.to_string(),
                reason: "curl_failed",
                detail: Some(format!("{}: {stderr}", output.status)),
            });
        }

        Ok(FetchedBody {
            bytes: output.stdout,
            content_type: Some(stderr).filter(|value| !value.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, RecordingSink};
    use anyhow::Result;
    use tempfile::tempdir;

    fn job(dir: &std::path::Path) -> Result<FetchJob> {
        Ok(FetchJob {
            file_id: FileId::new("9"),
            uri: "https://files.example.test/logo.png".into(),
            absolute_name: dir.join("logo.png"),
            done_action: Directive::parse("done", Some("api.file_done"))?,
            fail_action: Directive::parse("fail", Some("api.file_fail"))?,
        })
    }

    #[tokio::test]
    async fn successful_fetch_writes_and_reports_done() -> Result<()> {
        let dir = tempdir()?;
        let transport = Arc::new(FakeTransport::default());
        transport.respond(
            "https://files.example.test/logo.png",
            Ok(FetchedBody {
                bytes: b"png-bytes".to_vec(),
                content_type: Some("image/png".into()),
            }),
        );
        let sink = Arc::new(RecordingSink::default());
        let fetcher = RemoteFetcher::new(transport.clone(), sink.clone(), 0o644);

        let size = fetcher.run(job(dir.path())?).await?;
        assert_eq!(size, 9);
        assert_eq!(std::fs::read(dir.path().join("logo.png"))?, b"png-bytes");

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].directive.as_str(), "api.file_done");
        assert!(matches!(
            &reports[0].outcome,
            CompletionOutcome::Done { content_type: Some(ct), size: 9, .. } if ct == "image/png"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failed_fetch_reports_fail_and_writes_nothing() -> Result<()> {
        let dir = tempdir()?;
        let transport = Arc::new(FakeTransport::default());
        let sink = Arc::new(RecordingSink::default());
        let fetcher = RemoteFetcher::new(transport, sink.clone(), 0o644);

        let result = fetcher.run(job(dir.path())?).await;
        assert!(matches!(result, Err(SyncError::Fetch { .. })));
        assert!(!dir.path().join("logo.png").exists());

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].directive.as_str(), "api.file_fail");
        match &reports[0].outcome {
            CompletionOutcome::Failed { message } => assert!(message.contains("not_found")),
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn curl_command_fails_on_http_errors() {
        let transport = CurlTransport::new("curl", Duration::from_secs(30));
        let command = transport.command("https://files.example.test/a");
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--fail".to_string()));
        assert!(args.contains(&"30".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://files.example.test/a"));
    }

    #[tokio::test]
    async fn missing_curl_binary_is_an_io_error() {
        let transport = CurlTransport::new("/definitely/missing/curl", Duration::from_secs(1));
        let result = transport.fetch("https://files.example.test/a").await;
        assert!(matches!(result, Err(SyncError::Io { .. })));
    }
}
