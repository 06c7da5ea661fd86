pub mod alertmanager;
pub mod email;
pub mod format;
pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Settings;
use crate::models::alert::AlertMeta;

/// One notification channel. Implementations must not panic on delivery
/// failure; they log and return `false` instead.
#[async_trait]
pub trait Receiver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, subject: &str, description: &str, meta: &AlertMeta) -> bool;
}

/// Ordered set of configured channels. Transitions are dispatched as one
/// detached task per channel, so a slow or failing channel never blocks the
/// orchestrator or its siblings. No retries; failures are logged and dropped.
pub struct AlertFanout {
    receivers: Vec<Arc<dyn Receiver>>,
}

impl AlertFanout {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut receivers: Vec<Arc<dyn Receiver>> = Vec::new();

        if settings.telegram_enabled {
            receivers.push(Arc::new(telegram::TelegramReceiver::new(
                &settings.telegram_bot_token,
                &settings.telegram_chat_id,
            )));
            tracing::info!("telegram receiver enabled");
        }

        if settings.email_enabled {
            match email::EmailReceiver::new(
                &settings.smtp_server,
                settings.smtp_port,
                &settings.smtp_username,
                &settings.smtp_password,
                &settings.smtp_from,
                settings.email_recipients.clone(),
            ) {
                Some(r) => {
                    receivers.push(Arc::new(r));
                    tracing::info!("email receiver enabled");
                }
                None => tracing::warn!("email enabled but configuration incomplete, skipping"),
            }
        }

        if settings.alertmanager_enabled {
            match alertmanager::AlertmanagerReceiver::new(
                &settings.alertmanager_url,
                !settings.am_skip_ssl,
            ) {
                Ok(r) => {
                    receivers.push(Arc::new(r));
                    tracing::info!("alertmanager receiver enabled");
                }
                Err(e) => tracing::warn!("alertmanager receiver unavailable: {e}"),
            }
        }

        if receivers.is_empty() {
            tracing::warn!("no alert receivers enabled");
        }
        Self { receivers }
    }

    /// Hand-built fan-out, used by tests to capture transitions.
    pub fn with_receivers(receivers: Vec<Arc<dyn Receiver>>) -> Self {
        Self { receivers }
    }

    /// Fire-and-forget broadcast to every channel.
    pub fn broadcast(&self, subject: &str, description: &str, meta: &AlertMeta) {
        for receiver in &self.receivers {
            let receiver = receiver.clone();
            let subject = subject.to_string();
            let description = description.to_string();
            let meta = meta.clone();
            tokio::spawn(async move {
                if receiver.send(&subject, &description, &meta).await {
                    tracing::info!("broadcast to {} succeeded", receiver.name());
                } else {
                    tracing::warn!("broadcast to {} failed", receiver.name());
                }
            });
        }
    }
}
