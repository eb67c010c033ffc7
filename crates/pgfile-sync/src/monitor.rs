//! Owns the notification channel subscription and restores it when it drops.

use std::sync::Arc;

use pgfile_core::{Notification, NotificationSource, NotificationSubscriber, SyncResult};
use tracing::{info, warn};

/// Result of [`ChannelMonitor::ensure_subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Existing subscription kept.
    Healthy,
    /// A new subscription was established.
    Subscribed,
}

/// Channel subscription holder. At most one live source exists at a time.
pub struct ChannelMonitor {
    channel: String,
    subscriber: Arc<dyn NotificationSubscriber>,
    source: Option<Box<dyn NotificationSource>>,
}

impl std::fmt::Debug for ChannelMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMonitor")
            .field("channel", &self.channel)
            .field("subscribed", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

impl ChannelMonitor {
    /// Monitor `channel` using `subscriber`.
    #[must_use]
    pub fn new(channel: impl Into<String>, subscriber: Arc<dyn NotificationSubscriber>) -> Self {
        Self {
            channel: channel.into(),
            subscriber,
            source: None,
        }
    }

    /// Channel being monitored.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether a live subscription is held.
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.source.is_some()
    }

    /// Make sure a subscription is active, probing the existing one when `probe` is set.
    ///
    /// # Errors
    ///
    /// Returns `Subscription` when subscribing fails; the caller retries on a later tick.
    pub async fn ensure_subscription(&mut self, probe: bool) -> SyncResult<SubscriptionStatus> {
        if let Some(source) = self.source.as_mut() {
            if !probe {
                return Ok(SubscriptionStatus::Healthy);
            }
            match source.is_listening(&self.channel).await {
                Ok(true) => return Ok(SubscriptionStatus::Healthy),
                Ok(false) => {
                    warn!(channel = %self.channel, "subscription no longer registered");
                }
                Err(err) => {
                    warn!(
                        channel = %self.channel,
                        error = %err,
                        error_kind = err.kind(),
                        "subscription probe failed"
                    );
                }
            }
            self.source = None;
        }

        let source = self.subscriber.subscribe(&self.channel).await?;
        self.source = Some(source);
        info!(channel = %self.channel, "channel subscription established");
        Ok(SubscriptionStatus::Subscribed)
    }

    /// Wait for the next notification; pends forever while unsubscribed.
    ///
    /// A receive error drops the subscription so the next tick re-establishes it.
    pub async fn recv(&mut self) -> SyncResult<Notification> {
        let Some(source) = self.source.as_mut() else {
            return std::future::pending().await;
        };
        let received = source.recv().await;
        if received.is_err() {
            self.source = None;
        }
        received
    }

    /// Drop the current subscription.
    pub fn reset(&mut self) {
        self.source = None;
    }
}
