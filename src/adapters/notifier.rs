use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::ports::AlertDispatcher;

/// Notification adapter. `http(s)` channel URLs get the alert POSTed as
/// JSON; every other scheme (tgram://, discord://, mailto://, ...) is
/// forwarded to the external dispatcher service configured at startup,
/// which owns the provider integrations and retries. Without one, those
/// URLs are logged and dropped.
pub struct WebhookNotifier {
    client: reqwest::Client,
    dispatcher_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(dispatcher_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, dispatcher_url }
    }
}

#[async_trait]
impl AlertDispatcher for WebhookNotifier {
    #[instrument(skip(self, body))]
    async fn dispatch(
        &self,
        channel_url: &str,
        subject: &str,
        body: &str,
        severity: &str,
    ) -> anyhow::Result<()> {
        if channel_url.starts_with("http://") || channel_url.starts_with("https://") {
            self.client
                .post(channel_url)
                .json(&serde_json::json!({
                    "title": subject,
                    "body": body,
                    "severity": severity,
                }))
                .send()
                .await?
                .error_for_status()?;
            debug!("webhook notification delivered");
            return Ok(());
        }

        match &self.dispatcher_url {
            Some(dispatcher) => {
                self.client
                    .post(dispatcher)
                    .json(&serde_json::json!({
                        "urls": [channel_url],
                        "title": subject,
                        "body": body,
                    }))
                    .send()
                    .await?
                    .error_for_status()?;
                debug!("notification relayed to dispatcher");
                Ok(())
            }
            None => {
                warn!(
                    scheme = channel_url.split("://").next().unwrap_or("?"),
                    "no dispatcher configured for channel scheme, dropping notification"
                );
                Ok(())
            }
        }
    }
}
