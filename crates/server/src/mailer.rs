use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tramita_core::notify::{Mailer, SendResult};
use tramita_core::config::MailerConfig;

/// Posts messages to the configured HTTP mail API.
pub struct HttpMailer {
    client: Client,
    api_url: String,
    token: Option<SecretString>,
    sender: String,
}

impl HttpMailer {
    pub fn from_config(config: &MailerConfig) -> Option<Self> {
        let api_url = config.api_url.clone()?;
        let client =
            Client::builder().timeout(Duration::from_secs(config.timeout_secs.max(1))).build().ok()?;

        Some(Self { client, api_url, token: config.token.clone(), sender: config.sender.clone() })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> SendResult {
        let mut request = self.client.post(&self.api_url).json(&serde_json::json!({
            "from": self.sender,
            "to": recipients,
            "subject": subject,
            "body": body,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                SendResult { sent: true, provider: "http".to_string(), error: None }
            }
            Ok(response) => SendResult {
                sent: false,
                provider: "http".to_string(),
                error: Some(format!("unexpected status {}", response.status())),
            },
            Err(error) => SendResult {
                sent: false,
                provider: "http".to_string(),
                error: Some(error.to_string()),
            },
        }
    }
}

/// Local-development transport: accepts everything without delivering, so
/// environments without a mail API still persist notification markers.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, recipients: &[String], subject: &str, _body: &str) -> SendResult {
        tracing::debug!(
            event_name = "notification.noop_send",
            recipients = recipients.len(),
            subject = %subject,
            "mailer not configured, message dropped"
        );
        SendResult { sent: true, provider: "noop".to_string(), error: None }
    }
}

/// Test double recording every send.
#[derive(Default)]
pub struct RecordingMailer {
    pub messages: Mutex<Vec<(Vec<String>, String, String)>>,
    pub fail: bool,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> SendResult {
        if self.fail {
            return SendResult {
                sent: false,
                provider: "recording".to_string(),
                error: Some("smtp relay refused".to_string()),
            };
        }
        let mut messages = self.messages.lock().unwrap();
        messages.push((recipients.to_vec(), subject.to_string(), body.to_string()));
        SendResult { sent: true, provider: "recording".to_string(), error: None }
    }
}

impl RecordingMailer {
    pub fn sent_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}
