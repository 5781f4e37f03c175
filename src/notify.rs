//! Telling callers their job has finished.

use serde_json::json;

use crate::{jobs::status::JobState, prelude::*};

/// Delivers completion notifications.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Tell `address` that the job at `key` reached `status`.
    async fn notify(&self, address: &str, key: &str, status: JobState) -> Result<()>;
}

/// A [`Notifier`] which only logs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, address: &str, key: &str, status: JobState) -> Result<()> {
        info!("would notify {} that job {} is {}", address, key, status);
        Ok(())
    }
}

/// A [`Notifier`] which POSTs `{address, key, status}` to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier posting to `url`.
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(level = "debug", skip(self))]
    async fn notify(&self, address: &str, key: &str, status: JobState) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({
                "address": address,
                "key": key,
                "status": status,
            }))
            .send()
            .await
            .with_context(|| format!("failed to post notification to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("notification webhook {} refused", self.url))?;
        info!("notified {} that job {} is {}", address, key, status);
        Ok(())
    }
}
