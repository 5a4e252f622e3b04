//! Notification delivery towards the chat transport

use crate::error::Result;
use async_trait::async_trait;
use oopzbot_common::{Notification, NotificationKind};

/// Delivers NOTIFY payloads to the chat channel the bot plays into
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log; used when no chat transport is attached
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.kind {
            NotificationKind::Skipped | NotificationKind::Degraded | NotificationKind::FailedOver => {
                tracing::warn!(kind = ?notification.kind, "{}", notification.message)
            }
            _ => tracing::info!(kind = ?notification.kind, "{}", notification.message),
        }
        Ok(())
    }
}
