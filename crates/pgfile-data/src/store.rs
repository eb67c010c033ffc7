//! Desired-state batch and completion directives backed by stored procedures.

use async_trait::async_trait;
use chrono::Utc;
use pgfile_core::{
    AuthorizeRow, BatchResults, CompletionReport, CompletionSink, FileId, FileRow,
    FileStateSource, Session, SyncResult,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::{DataError, Result};

const AUTHORIZE_CALL: &str = r"
    SELECT authorized, message
    FROM api.authorize(_session => $1)
";

const GET_FILE_CALL: &str = r#"
    SELECT "type", path, name, hash, mime, data, done, fail
    FROM api.get_file(_file_id => $1)
"#;

/// Repository that runs the authorize/fetch batch and invokes completion directives.
#[derive(Clone)]
pub struct PgFileStore {
    pool: PgPool,
}

impl PgFileStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_batch(&self, session: &Session, file_id: &FileId) -> Result<BatchResults> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| DataError::query("begin batch", source))?;

        let authorize = sqlx::query(AUTHORIZE_CALL)
            .bind(session.token())
            .fetch_all(&mut *tx)
            .await
            .map_err(|source| DataError::query("authorize", source))?
            .iter()
            .map(authorize_row)
            .collect::<Result<Vec<_>>>()?;

        // Statement 1 only runs once statement 0 has affirmed the session.
        let affirmed = authorize.first().is_some_and(|row| row.authorized);
        let file = if affirmed {
            sqlx::query(GET_FILE_CALL)
                .bind(file_id.as_str())
                .fetch_all(&mut *tx)
                .await
                .map_err(|source| DataError::query("get file", source))?
                .iter()
                .map(file_row)
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        tx.commit()
            .await
            .map_err(|source| DataError::query("commit batch", source))?;

        debug!(
            file_id = %file_id,
            authorize_rows = authorize.len(),
            file_rows = file.len(),
            "query batch completed"
        );
        Ok(BatchResults { authorize, file })
    }

    async fn call_directive(&self, report: &CompletionReport) -> Result<()> {
        let mut detail = report.detail();
        if let Value::Object(map) = &mut detail {
            map.insert(
                "completed_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        let statement = directive_statement(report.directive.as_str());
        sqlx::query(&statement)
            .bind(report.file_id.as_str())
            .bind(Json(detail))
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::query("completion directive", source))?;
        Ok(())
    }
}

#[async_trait]
impl FileStateSource for PgFileStore {
    async fn fetch_file_state(
        &self,
        session: &Session,
        file_id: &FileId,
    ) -> SyncResult<BatchResults> {
        Ok(self.run_batch(session, file_id).await?)
    }
}

#[async_trait]
impl CompletionSink for PgFileStore {
    async fn report(&self, report: CompletionReport) -> SyncResult<()> {
        Ok(self.call_directive(&report).await?)
    }
}

/// Directives are validated identifiers (`name` or `schema.name`), so they can be
/// spliced into the statement text.
fn directive_statement(directive: &str) -> String {
    format!("SELECT {directive}($1, $2::jsonb)")
}

fn authorize_row(row: &PgRow) -> Result<AuthorizeRow> {
    Ok(AuthorizeRow {
        authorized: column::<Option<bool>>(row, "authorize", "authorized")?.unwrap_or(false),
        message: column(row, "authorize", "message")?,
    })
}

fn file_row(row: &PgRow) -> Result<FileRow> {
    Ok(FileRow {
        kind: column(row, "get file", "type")?,
        path: column(row, "get file", "path")?,
        name: column(row, "get file", "name")?,
        hash: column(row, "get file", "hash")?,
        mime: column(row, "get file", "mime")?,
        data: column(row, "get file", "data")?,
        done: column(row, "get file", "done")?,
        fail: column(row, "get file", "fail")?,
    })
}

fn column<'r, T>(row: &'r PgRow, statement: &'static str, name: &'static str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(|source| DataError::ColumnDecode {
        statement,
        column: name,
        source,
    })
}
