//! Dead-letter queue for deliveries that keep failing.
//!
//! Only used when `worker.max_redeliveries` is set. A delivery that has been
//! republished that many times is parked here with the failure attached as
//! headers, for manual inspection and replay. The channel must be in confirm
//! mode: a body only counts as parked once the broker confirms it.
//!
//! # Example
//!
//! ```rust,ignore
//! use marquee::dlq::{DeadLetterQueue, FailedDelivery};
//!
//! let dlq = DeadLetterQueue::declare(channel, "movies.worker.dlq", Duration::from_secs(5)).await?;
//! let failed = FailedDelivery::new("movie.deleted", "movie not found".into(), 5, None);
//! dlq.add_failed_delivery(&body, &failed).await?;
//!
//! let parked = dlq.count().await?;
//! ```

use chrono::{DateTime, Utc};
use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::broker::publisher::{publish_mandatory, CONTENT_TYPE_JSON, PERSISTENT};
use crate::broker::REDELIVERY_HEADER;

pub const ERROR_HEADER: &str = "x-error";
pub const FAILED_AT_HEADER: &str = "x-failed-at";
pub const ROUTING_KEY_HEADER: &str = "x-original-routing-key";

/// Failure details stored alongside a parked body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    /// Routing key the message was originally published with
    pub routing_key: String,

    /// Error from the last attempt
    pub error: String,

    pub redeliveries: u32,

    pub failed_at: DateTime<Utc>,

    pub correlation_id: Option<String>,
}

impl FailedDelivery {
    pub fn new(
        routing_key: &str,
        error: String,
        redeliveries: u32,
        correlation_id: Option<&str>,
    ) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            error,
            redeliveries,
            failed_at: Utc::now(),
            correlation_id: correlation_id.map(str::to_string),
        }
    }

    pub fn headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(
            ERROR_HEADER.into(),
            AMQPValue::LongString(LongString::from(self.error.as_str())),
        );
        headers.insert(
            FAILED_AT_HEADER.into(),
            AMQPValue::LongString(LongString::from(self.failed_at.to_rfc3339())),
        );
        headers.insert(
            ROUTING_KEY_HEADER.into(),
            AMQPValue::LongString(LongString::from(self.routing_key.as_str())),
        );
        headers.insert(
            REDELIVERY_HEADER.into(),
            AMQPValue::LongUInt(self.redeliveries),
        );
        headers
    }

    fn properties(&self) -> BasicProperties {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(self.headers());

        match &self.correlation_id {
            Some(id) => properties.with_correlation_id(id.as_str().into()),
            None => properties,
        }
    }
}

/// Durable queue bound to the default exchange.
#[derive(Clone)]
pub struct DeadLetterQueue {
    channel: Channel,
    queue: String,
    confirm_timeout: Duration,
}

impl DeadLetterQueue {
    /// Declare the queue (idempotent) on `channel`.
    pub async fn declare(
        channel: Channel,
        queue: &str,
        confirm_timeout: Duration,
    ) -> Result<Self, DlqError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(queue = %queue, error = %e, "Failed to declare dead-letter queue");
                DlqError::Declare(e.to_string())
            })?;

        debug!(queue = %queue, "Dead-letter queue declared");
        Ok(Self {
            channel,
            queue: queue.to_string(),
            confirm_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    /// Park `body` with its failure details. Returns once the broker confirms.
    pub async fn add_failed_delivery(
        &self,
        body: &[u8],
        failed: &FailedDelivery,
    ) -> Result<(), DlqError> {
        // Default exchange routes by queue name
        publish_mandatory(
            &self.channel,
            "",
            &self.queue,
            body,
            failed.properties(),
            self.confirm_timeout,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to add delivery to dead-letter queue");
            DlqError::Publish(e.to_string())
        })?;

        info!(
            queue = %self.queue,
            routing_key = %failed.routing_key,
            redeliveries = failed.redeliveries,
            correlation_id = failed.correlation_id.as_deref().unwrap_or("-"),
            error = %failed.error,
            "Delivery moved to dead-letter queue"
        );
        Ok(())
    }

    /// Messages currently parked.
    pub async fn count(&self) -> Result<u32, DlqError> {
        let queue = self
            .channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DlqError::Declare(e.to_string()))?;

        Ok(queue.message_count())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("failed to declare dead-letter queue: {0}")]
    Declare(String),

    #[error("failed to publish to dead-letter queue: {0}")]
    Publish(String),
}
