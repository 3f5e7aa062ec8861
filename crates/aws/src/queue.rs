use std::collections::HashMap;

use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName, SendMessageBatchRequestEntry};
use brenda_core::config::Config;
use brenda_core::error::TaskError;
use brenda_core::urls::parse_sqs_url;
use brenda_engine::{QueueMessage, WorkQueue};
use tracing::debug;

use crate::{sdk_config, transient_err};

/// One entry of a batched enqueue: a local id for the batch response, the
/// task script body, a delivery delay and the `script_name` attribute.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub id: String,
    pub body: String,
    pub delay_seconds: u32,
    pub script_name: String,
}

/// Maximum entries a single batch write may carry.
pub const BATCH_MAX: usize = 10;

/// The SQS work queue named by the `WORK_QUEUE` config key.
pub struct SqsWorkQueue {
    client: Client,
    queue_url: String,
    name: String,
}

impl SqsWorkQueue {
    /// Connect to an existing queue.
    pub async fn connect(conf: &Config) -> Result<Self, TaskError> {
        let name = parse_sqs_url(conf.require("WORK_QUEUE")?)?.to_string();
        let client = Client::new(&sdk_config("SQS_REGION", conf).await);
        let out = client
            .get_queue_url()
            .queue_name(&name)
            .send()
            .await
            .map_err(transient_err("resolving work queue url"))?;
        let queue_url = out
            .queue_url()
            .ok_or_else(|| TaskError::fatal_msg(format!("queue {name:?} has no url")))?
            .to_string();
        debug!("work queue url: {queue_url}");
        Ok(Self {
            client,
            queue_url,
            name,
        })
    }

    /// Create the queue if needed and connect to it. Visibility timeout and
    /// retention come from config, with the provider's 14-day maximum
    /// retention as the default.
    pub async fn create(conf: &Config) -> Result<Self, TaskError> {
        let name = parse_sqs_url(conf.require("WORK_QUEUE")?)?.to_string();
        let visibility_timeout = conf.get_u32_or("VISIBILITY_TIMEOUT", 120);
        let retention = conf.get_u64_or("MESSAGE_RETENTION", 1_209_600);
        let client = Client::new(&sdk_config("SQS_REGION", conf).await);
        let out = client
            .create_queue()
            .queue_name(&name)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                visibility_timeout.to_string(),
            )
            .attributes(QueueAttributeName::MessageRetentionPeriod, retention.to_string())
            .send()
            .await
            .map_err(transient_err("creating work queue"))?;
        let queue_url = out
            .queue_url()
            .ok_or_else(|| TaskError::fatal_msg(format!("queue {name:?} has no url")))?
            .to_string();
        Ok(Self {
            client,
            queue_url,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue up to [`BATCH_MAX`] messages in one request. Entry-level
    /// failures are reported by the service without failing the request, so
    /// they are surfaced here as a retryable error.
    pub async fn write_batch(&self, entries: &[BatchEntry]) -> Result<(), TaskError> {
        if entries.is_empty() {
            return Ok(());
        }
        if entries.len() > BATCH_MAX {
            return Err(TaskError::fatal_msg(format!(
                "batch of {} exceeds the {BATCH_MAX}-message limit",
                entries.len()
            )));
        }
        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            let attr = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(&entry.script_name)
                .build()
                .map_err(|err| TaskError::fatal(anyhow::anyhow!("building attribute: {err}")))?;
            batch.push(
                SendMessageBatchRequestEntry::builder()
                    .id(&entry.id)
                    .message_body(&entry.body)
                    .delay_seconds(entry.delay_seconds as i32)
                    .message_attributes("script_name", attr)
                    .build()
                    .map_err(|err| TaskError::fatal(anyhow::anyhow!("building batch entry: {err}")))?,
            );
        }
        let out = self
            .client
            .send_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(batch))
            .send()
            .await
            .map_err(transient_err("writing message batch"))?;
        if !out.failed().is_empty() {
            return Err(TaskError::transient_msg(format!(
                "{} of {} batch entries failed",
                out.failed().len(),
                entries.len()
            )));
        }
        Ok(())
    }

    /// Approximate number of visible messages, for `work status`.
    pub async fn approximate_count(&self) -> Result<u64, TaskError> {
        let out = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(transient_err("reading queue attributes"))?;
        let count = out
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Ok(count)
    }

    /// Drop all queued messages, keeping the queue.
    pub async fn purge(&self) -> Result<(), TaskError> {
        self.client
            .purge_queue()
            .queue_url(&self.queue_url)
            .send()
            .await
            .map_err(transient_err("purging work queue"))?;
        Ok(())
    }

    /// Delete the queue itself.
    pub async fn delete_queue(&self) -> Result<(), TaskError> {
        self.client
            .delete_queue()
            .queue_url(&self.queue_url)
            .send()
            .await
            .map_err(transient_err("deleting work queue"))?;
        Ok(())
    }
}

impl WorkQueue for SqsWorkQueue {
    async fn receive(&self) -> Result<Option<QueueMessage>, TaskError> {
        let out = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(0)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(transient_err("receiving message"))?;
        let Some(message) = out.messages().first() else {
            return Ok(None);
        };
        let receipt = message
            .receipt_handle()
            .ok_or_else(|| TaskError::fatal_msg("received message without a receipt handle"))?
            .to_string();
        let body = message.body().unwrap_or_default().to_string();
        let mut attributes = HashMap::new();
        if let Some(map) = message.message_attributes() {
            for (key, value) in map {
                if let Some(raw) = value.string_value() {
                    attributes.insert(key.clone(), raw.to_string());
                }
            }
        }
        Ok(Some(QueueMessage {
            body,
            attributes,
            receipt,
        }))
    }

    async fn extend(&self, receipt: &str, seconds: u32) -> Result<(), TaskError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(transient_err("changing message visibility"))?;
        Ok(())
    }

    async fn delete(&self, receipt: &str) -> Result<(), TaskError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(transient_err("deleting message"))?;
        Ok(())
    }
}
