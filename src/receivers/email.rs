use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;

use crate::models::alert::{AlertMeta, AlertStatus};
use crate::receivers::Receiver;

pub struct EmailReceiver {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    recipients: Vec<String>,
    tag_re: Regex,
}

impl EmailReceiver {
    /// Returns `None` when the configuration is incomplete (no server or no
    /// recipients) or the relay cannot be constructed.
    pub fn new(
        server: &str,
        port: u16,
        username: &str,
        password: &str,
        from: &str,
        recipients: Vec<String>,
    ) -> Option<Self> {
        if server.is_empty() || recipients.is_empty() {
            return None;
        }
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server).ok()?;
        builder = builder.port(port);
        if !username.is_empty() && !password.is_empty() {
            builder =
                builder.credentials(Credentials::new(username.to_string(), password.to_string()));
        }
        Some(Self {
            transport: builder.build(),
            from: from.to_string(),
            recipients,
            tag_re: Regex::new("<[^<]+?>").ok()?,
        })
    }

    fn strip_tags(&self, html: &str) -> String {
        self.tag_re.replace_all(html, "").into_owned()
    }
}

fn subject_prefix(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::Firing => "[AIOps Alert]",
        AlertStatus::Repeating => "[AIOps REMINDER]",
        AlertStatus::Resolved => "[AIOps Resolved]",
    }
}

#[async_trait]
impl Receiver for EmailReceiver {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, subject: &str, description: &str, meta: &AlertMeta) -> bool {
        let body = format!(
            "AIOps Notification\n\
             ==================\n\
             Status: {}\n\
             Server: {}\n\
             Severity: {}\n\
             ------------------\n\n\
             {}\n",
            meta.status.as_str().to_uppercase(),
            meta.instance,
            meta.severity,
            self.strip_tags(description),
        );

        let mut builder = Message::builder()
            .from(self.from.parse().unwrap_or_else(|_| {
                "aiops@localhost"
                    .parse()
                    .expect("hardcoded fallback address is a valid mailbox")
            }))
            .subject(format!("{} {subject}", subject_prefix(meta.status)))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            match recipient.parse() {
                Ok(mailbox) => builder = builder.to(mailbox),
                Err(e) => {
                    tracing::warn!("email: bad recipient address {recipient}: {e}");
                }
            }
        }

        let email = match builder.body(body) {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!("email: failed to build message: {e}");
                return false;
            }
        };

        match self.transport.send(email).await {
            Ok(_) => {
                tracing::info!("email alert sent to {} recipient(s)", self.recipients.len());
                true
            }
            Err(e) => {
                tracing::warn!("email alert failed: {e}");
                false
            }
        }
    }
}
