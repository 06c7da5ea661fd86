use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::alert::{AlertMeta, AlertStatus};
use crate::receivers::Receiver;

/// Legacy Alertmanager push, kept as one more fan-out channel. Posts the v2
/// list payload to `/api/v2/alerts`.
pub struct AlertmanagerReceiver {
    http: reqwest::Client,
    alert_url: String,
}

impl AlertmanagerReceiver {
    pub fn new(base_url: &str, verify_ssl: bool) -> anyhow::Result<Self> {
        let base = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url.to_string()
        } else {
            format!("http://{base_url}")
        };
        let base = base.trim_end_matches('/');
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;
        Ok(Self {
            http,
            alert_url: format!("{base}/api/v2/alerts"),
        })
    }
}

#[async_trait]
impl Receiver for AlertmanagerReceiver {
    fn name(&self) -> &'static str {
        "alertmanager"
    }

    async fn send(&self, subject: &str, description: &str, meta: &AlertMeta) -> bool {
        let mut alert = serde_json::json!({
            "labels": {
                "alertname": "AIOpsAnomaly",
                "instance": meta.instance,
                "severity": meta.severity,
            },
            "annotations": {
                "summary": format!("{subject}: {}", meta.summary),
                "description": description,
            },
        });
        if meta.status == AlertStatus::Resolved {
            alert["endsAt"] = serde_json::json!(Utc::now().to_rfc3339());
        }

        // Alertmanager expects a list of alerts.
        let result = self
            .http
            .post(&self.alert_url)
            .json(&serde_json::json!([alert]))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => {
                tracing::info!("alertmanager push succeeded for {}", meta.instance);
                true
            }
            Err(e) => {
                tracing::warn!("alertmanager push failed: {e}");
                false
            }
        }
    }
}
