//! Webhook audit sink
//!
//! Publishes each event as a JSON POST to the configured endpoint. The
//! receiving side routes events by the queue name header.

use super::event::AuditEvent;
use crate::config::AuditSinkConfiguration;
use crate::domain::ports::AuditSink;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const QUEUE_HEADER: &str = "X-Audit-Queue";

pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    queue_name: String,
}

impl WebhookSink {
    pub fn new(config: &AuditSinkConfiguration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build audit client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            queue_name: config.queue_name.clone(),
        })
    }
}

#[async_trait]
impl AuditSink for WebhookSink {
    async fn publish(&self, event: &AuditEvent) -> Result<()> {
        debug!("Posting audit event {} to {}", event.id, self.url);

        self.client
            .post(&self.url)
            .header(QUEUE_HEADER, &self.queue_name)
            .json(event)
            .send()
            .await
            .map_err(|e| Error::AuditPublish(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::AuditPublish(e.to_string()))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}
