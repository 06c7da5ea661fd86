use std::time::Duration;

use async_trait::async_trait;

use crate::models::alert::{AlertMeta, AlertStatus};
use crate::receivers::Receiver;

pub struct TelegramReceiver {
    http: reqwest::Client,
    api_url: String,
    chat_id: String,
    configured: bool,
}

impl TelegramReceiver {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            chat_id: chat_id.to_string(),
            configured: !bot_token.is_empty() && !chat_id.is_empty(),
        }
    }
}

#[async_trait]
impl Receiver for TelegramReceiver {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, _subject: &str, description: &str, meta: &AlertMeta) -> bool {
        if !self.configured {
            tracing::warn!("telegram configuration missing, skipping");
            return false;
        }

        let (icon, title) = match meta.status {
            AlertStatus::Firing => ("🔥", "ANOMALY DETECTED"),
            AlertStatus::Repeating => ("🔄", "REMINDER: ISSUE STILL ACTIVE"),
            AlertStatus::Resolved => ("✅", "ISSUE RESOLVED"),
        };

        let message = format!(
            "🤖 <b>{title}</b>\n\
             ──────────────────\n\
             {icon} <b>Status:</b> {}\n\
             🖥️ <b>Server:</b> {}\n\
             ⚠️ <b>Severity:</b> {}\n\n\
             📝 <b>Analysis:</b>\n{description}\n\n\
             📊 <b>Summary:</b> {}",
            meta.status.as_str().to_uppercase(),
            meta.instance,
            meta.severity,
            meta.summary,
        );

        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "HTML",
        });

        let result = self
            .http
            .post(&self.api_url)
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => {
                tracing::info!("telegram alert sent for {}", meta.instance);
                true
            }
            Err(e) => {
                tracing::warn!("telegram alert failed: {e}");
                false
            }
        }
    }
}
