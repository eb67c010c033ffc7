//! LISTEN/NOTIFY subscription for change notices.

use async_trait::async_trait;
use pgfile_core::{
    Notification, NotificationSource, NotificationSubscriber, SyncError, SyncResult,
};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{debug, info};

use crate::error::DataError;

const LISTENING_CHANNELS_CALL: &str = "SELECT pg_listening_channels()";

/// Opens dedicated listener connections from the shared pool's options.
#[derive(Clone)]
pub struct PgSubscriber {
    pool: PgPool,
}

impl PgSubscriber {
    /// Wrap a pool whose connection options are reused for listeners.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSubscriber for PgSubscriber {
    async fn subscribe(&self, channel: &str) -> SyncResult<Box<dyn NotificationSource>> {
        let subscription_error = |source: sqlx::Error| SyncError::Subscription {
            channel: channel.to_string(),
            source: Box::new(source),
        };

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(subscription_error)?;
        listener.listen(channel).await.map_err(subscription_error)?;
        info!(channel, "listening for change notices");

        Ok(Box::new(PgNotificationSource { listener }))
    }
}

/// Live LISTEN connection.
pub struct PgNotificationSource {
    listener: PgListener,
}

impl std::fmt::Debug for PgNotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotificationSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn recv(&mut self) -> SyncResult<Notification> {
        let notification = self
            .listener
            .recv()
            .await
            .map_err(|source| DataError::query("receive notification", source))?;
        debug!(channel = notification.channel(), "notification received");
        Ok(Notification {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
        })
    }

    async fn is_listening(&mut self, channel: &str) -> SyncResult<bool> {
        let channels: Vec<String> = sqlx::query_scalar(LISTENING_CHANNELS_CALL)
            .fetch_all(&mut self.listener)
            .await
            .map_err(|source| DataError::query("probe listening channels", source))?;
        Ok(channels.iter().any(|listening| listening == channel))
    }
}
