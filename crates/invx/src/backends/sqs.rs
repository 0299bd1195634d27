//! 📨 SQS queue: one `SendMessage` per requeue message.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::config::Region;
use serde::Deserialize;
use tracing::debug;

use crate::backends::IngestQueue;

#[derive(Debug, Deserialize, Clone)]
pub struct SqsQueueConfig {
    /// 📬 Full queue URL, e.g. `https://sqs.us-east-1.amazonaws.com/123456789012/inventory`.
    pub url: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsQueue {
    pub async fn new(config: &SqsQueueConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let the_aws_config = loader.load().await;
        Self {
            client: aws_sdk_sqs::Client::new(&the_aws_config),
            queue_url: config.url.clone(),
        }
    }
}

#[async_trait]
impl IngestQueue for SqsQueue {
    async fn enqueue(&self, message_body: String) -> Result<()> {
        let body_len = message_body.len();
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(message_body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "💀 SendMessage to '{}' failed. The records in this message will only come back if the original delivery is retried.",
                    self.queue_url
                )
            })?;
        debug!(
            "📨 Requeued {} bytes as message {:?}",
            body_len,
            output.message_id()
        );
        Ok(())
    }
}
