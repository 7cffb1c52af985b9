use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// Outbound email. The identity flow only cares whether delivery was accepted.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Development mailer: writes the message to the log instead of sending it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        info!(to, subject, "Outgoing email: {}", body);
        Ok(())
    }
}

/// Hands messages to an HTTP mail relay as JSON.
pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
    from: String,
}

#[derive(Serialize)]
struct OutgoingMail<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

impl WebhookMailer {
    pub fn new(client: reqwest::Client, url: String, from: String) -> Self {
        Self { client, url, from }
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let mail = OutgoingMail { from: &self.from, to, subject, text: body };
        let resp = self.client.post(&self.url).json(&mail).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("mail relay answered {}", resp.status());
        }
        info!(to, "Email handed to relay");
        Ok(())
    }
}
