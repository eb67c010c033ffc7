//! Session acquisition through the upstream login routine.

use std::fmt;

use async_trait::async_trait;
use pgfile_core::{Authenticator, Session, SyncError, SyncResult};
use sqlx::{PgPool, Row};

use crate::error::DataError;

const LOGIN_CALL: &str = r"
    SELECT session
    FROM api.login(_client_id => $1, _client_secret => $2)
";

/// Authenticator that trades client credentials for a session token.
#[derive(Clone)]
pub struct PgAuthenticator {
    pool: PgPool,
    client_id: String,
    client_secret: String,
}

impl fmt::Debug for PgAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgAuthenticator")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl PgAuthenticator {
    /// Build an authenticator for the supplied credentials.
    #[must_use]
    pub fn new(pool: PgPool, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            pool,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl Authenticator for PgAuthenticator {
    async fn authenticate(&self) -> SyncResult<Session> {
        let row = sqlx::query(LOGIN_CALL)
            .bind(&self.client_id)
            .bind(&self.client_secret)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| DataError::query("login", source))?;

        let token = row
            .map(|row| row.try_get::<Option<String>, _>("session"))
            .transpose()
            .map_err(|source| DataError::ColumnDecode {
                statement: "login",
                column: "session",
                source,
            })?
            .flatten()
            .filter(|token| !token.is_empty());

        token.map(Session::new).ok_or_else(|| SyncError::Authorization {
            message: "login returned no session".to_string(),
        })
    }
}
