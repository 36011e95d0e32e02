//! Notification operations

use async_trait::async_trait;

use super::{Notification, Notifier};
use crate::error::AppError;
use crate::recipe::types::NotifyLevel;

/// Notifier that writes to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), AppError> {
        let title = notification.title.as_str();
        let message = notification.message.as_deref().unwrap_or("");
        match notification.level {
            NotifyLevel::Info | NotifyLevel::Success => {
                tracing::info!(level = ?notification.level, "{title}: {message}")
            }
            NotifyLevel::Warning => tracing::warn!("{title}: {message}"),
            NotifyLevel::Error => tracing::error!("{title}: {message}"),
        }
        Ok(())
    }
}
