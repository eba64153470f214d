//! Queue worker.
//!
//! Pulls envelopes off the shared work queue one at a time (prefetch 1,
//! manual acks), applies them through a [`MovieWriter`] and settles each
//! delivery before asking for the next:
//!
//! | Outcome                         | Settlement                          |
//! |---------------------------------|-------------------------------------|
//! | applied                         | ack                                 |
//! | unknown action                  | ack (ignored)                       |
//! | bad envelope / writer failure   | requeue, or retry then dead-letter  |
//!
//! Requeueing forever is the default. Setting `worker.max_redeliveries`
//! switches failed deliveries to republish-with-counter and, once the
//! counter hits the limit, to the dead-letter queue. The original is only
//! acked once the broker confirms the copy; otherwise it is requeued.
//!
//! Shutdown is only observed between deliveries, so an in-flight delivery is
//! always settled before the loop exits.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ConfirmSelectOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::publisher::{publish_mandatory, CONTENT_TYPE_JSON, PERSISTENT};
use super::{
    close_channel, close_connection, connect, declare_exchange, declare_work_queue, header_u32,
    ConnectionError, REDELIVERY_HEADER,
};
use crate::config::{AppConfig, BrokerConfig};
use crate::dlq::{DeadLetterQueue, DlqError, FailedDelivery};
use crate::event::{Envelope, MovieCommand};
use crate::movies::MovieWriter;
use crate::shutdown::ShutdownSignal;

/// Unacknowledged deliveries the broker may push to one consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Log running totals every this many deliveries.
const STATS_LOG_INTERVAL: u64 = 100;

/// Consumer lifecycle, observable through [`ConsumerState::channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Draining,
    Closed,
    Failed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Draining => "draining",
            ConsumerState::Closed => "closed",
            ConsumerState::Failed => "failed",
        }
    }

    /// A fresh state channel starting at `Disconnected`.
    pub fn channel() -> (watch::Sender<ConsumerState>, watch::Receiver<ConsumerState>) {
        watch::channel(ConsumerState::Disconnected)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to start consuming: {0}")]
    Setup(#[source] lapin::Error),

    #[error("delivery stream failed: {0}")]
    Stream(String),

    #[error("delivery stream closed by broker")]
    StreamEnded,

    #[error("failed to settle delivery: {0}")]
    Settle(String),

    #[error(transparent)]
    DeadLetter(#[from] DlqError),
}

/// Result of handling one delivery body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Well-formed envelope with an action this worker does not handle
    Ignored { action: String },
    Failed { reason: String, permanent: bool },
}

/// How a delivery is handed back to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Negative-ack with requeue
    Requeue,
    /// Republish with the redelivery counter set, then ack the original
    Retry { redeliveries: u32 },
    /// Park in the dead-letter queue, then ack the original
    DeadLetter { reason: String, redeliveries: u32 },
}

/// What to do with failed deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// `None` requeues forever
    pub max_redeliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn requeue_forever() -> Self {
        Self::default()
    }

    pub fn dead_letter_after(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries: Some(max_redeliveries),
        }
    }

    pub fn settlement(&self, outcome: &Outcome, redeliveries: u32) -> Settlement {
        let reason = match outcome {
            Outcome::Processed | Outcome::Ignored { .. } => return Settlement::Ack,
            Outcome::Failed { reason, .. } => reason,
        };

        match self.max_redeliveries {
            None => Settlement::Requeue,
            Some(max) if redeliveries >= max => Settlement::DeadLetter {
                reason: reason.clone(),
                redeliveries,
            },
            Some(_) => Settlement::Retry {
                redeliveries: redeliveries + 1,
            },
        }
    }
}

/// A message handed to the worker by the broker.
pub trait InboundDelivery: Send {
    fn body(&self) -> &[u8];
    fn routing_key(&self) -> &str;
    fn correlation_id(&self) -> Option<&str>;

    /// Broker flag: this copy was delivered before and not acked
    fn redelivered(&self) -> bool;

    /// Times this message was republished by a worker after failing
    fn redelivery_count(&self) -> u32;
}

/// Where settlements go.
#[async_trait]
pub trait DeliverySink<D: InboundDelivery>: Send + Sync {
    /// Apply `settlement` and return what was actually done.
    ///
    /// `Retry` and `DeadLetter` ack the original only after the broker has
    /// taken the copy. When it has not, the original is requeued and
    /// `Requeue` is returned.
    async fn settle(&self, delivery: D, settlement: Settlement)
        -> Result<Settlement, ConsumerError>;
}

/// Running totals for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub ignored: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    pub fn total(&self) -> u64 {
        self.processed + self.ignored + self.failed
    }

    fn record(&mut self, outcome: &Outcome, settlement: &Settlement) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Ignored { .. } => self.ignored += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
        if matches!(settlement, Settlement::DeadLetter { .. }) {
            self.dead_lettered += 1;
        }
    }
}

/// Decode `body` and apply it.
pub async fn handle_delivery(writer: &dyn MovieWriter, body: &[u8]) -> Outcome {
    let envelope = match Envelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Outcome::Failed {
                reason: e.to_string(),
                permanent: true,
            }
        }
    };

    let command = match envelope.command() {
        Ok(Some(command)) => command,
        Ok(None) => {
            return Outcome::Ignored {
                action: envelope.action,
            }
        }
        Err(e) => {
            return Outcome::Failed {
                reason: e.to_string(),
                permanent: true,
            }
        }
    };

    let result = match command {
        MovieCommand::Create { title, year } => match writer.create_movie(&title, year).await {
            Ok(movie) => {
                debug!(id = %movie.id, "Create applied");
                Ok(())
            }
            Err(e) => Err(e),
        },
        MovieCommand::Delete { id } => writer.delete_movie(&id).await,
    };

    match result {
        Ok(()) => Outcome::Processed,
        Err(e) => Outcome::Failed {
            reason: e.to_string(),
            permanent: e.is_permanent(),
        },
    }
}

/// Consume `deliveries` until shutdown, one at a time.
///
/// Returns when shutdown is observed between deliveries. A broken or ended
/// stream and a failed settlement are errors.
pub async fn run_loop<S, D, E, K>(
    deliveries: S,
    sink: &K,
    writer: &dyn MovieWriter,
    policy: &RedeliveryPolicy,
    shutdown: &ShutdownSignal,
    state: &watch::Sender<ConsumerState>,
) -> Result<WorkerStats, ConsumerError>
where
    S: Stream<Item = Result<D, E>>,
    D: InboundDelivery,
    E: fmt::Display,
    K: DeliverySink<D>,
{
    tokio::pin!(deliveries);
    let mut stats = WorkerStats::default();

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(error = %e, "Delivery stream failed");
                return Err(ConsumerError::Stream(e.to_string()));
            }
            None => {
                warn!("Delivery stream ended");
                return Err(ConsumerError::StreamEnded);
            }
        };

        let redeliveries = delivery.redelivery_count();
        let outcome = handle_delivery(writer, delivery.body()).await;
        let settlement = policy.settlement(&outcome, redeliveries);

        match &outcome {
            Outcome::Processed => debug!(
                routing_key = %delivery.routing_key(),
                correlation_id = delivery.correlation_id().unwrap_or("-"),
                "Delivery processed"
            ),
            Outcome::Ignored { action } => warn!(
                action = %action,
                routing_key = %delivery.routing_key(),
                correlation_id = delivery.correlation_id().unwrap_or("-"),
                "Unknown action, acknowledging"
            ),
            Outcome::Failed { reason, permanent } => error!(
                reason = %reason,
                permanent = permanent,
                redelivered = delivery.redelivered(),
                redeliveries = redeliveries,
                settlement = ?settlement,
                routing_key = %delivery.routing_key(),
                correlation_id = delivery.correlation_id().unwrap_or("-"),
                "Delivery failed"
            ),
        }

        let applied = sink.settle(delivery, settlement).await?;
        stats.record(&outcome, &applied);

        if stats.total() % STATS_LOG_INTERVAL == 0 {
            info!(
                processed = stats.processed,
                ignored = stats.ignored,
                failed = stats.failed,
                dead_lettered = stats.dead_lettered,
                "Worker stats"
            );
        }
    }

    state.send_replace(ConsumerState::Draining);
    info!(
        processed = stats.processed,
        failed = stats.failed,
        "Shutdown observed, consumer draining"
    );
    Ok(stats)
}

impl InboundDelivery for Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn routing_key(&self) -> &str {
        self.routing_key.as_str()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id().as_ref().map(|id| id.as_str())
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn redelivery_count(&self) -> u32 {
        header_u32(self.properties.headers(), REDELIVERY_HEADER).unwrap_or(0)
    }
}

/// Settles lapin deliveries on the consuming channel.
///
/// With a redelivery limit the channel is in confirm mode, so republished
/// and parked copies are confirmed before the original is acked.
struct AmqpSink {
    channel: Channel,
    exchange: String,
    dlq: Option<DeadLetterQueue>,
    confirm_timeout: Duration,
}

impl AmqpSink {
    async fn republish(&self, delivery: &Delivery, redeliveries: u32) -> Result<(), ConsumerError> {
        let mut headers = delivery
            .properties
            .headers()
            .clone()
            .unwrap_or_default();
        headers.insert(REDELIVERY_HEADER.into(), AMQPValue::LongUInt(redeliveries));

        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);
        if let Some(id) = delivery.properties.correlation_id() {
            properties = properties.with_correlation_id(id.clone());
        }

        publish_mandatory(
            &self.channel,
            &self.exchange,
            delivery.routing_key.as_str(),
            &delivery.data,
            properties,
            self.confirm_timeout,
        )
        .await
        .map_err(|e| ConsumerError::Settle(e.to_string()))
    }

    async fn park(
        &self,
        delivery: &Delivery,
        reason: &str,
        redeliveries: u32,
    ) -> Result<(), ConsumerError> {
        let Some(dlq) = &self.dlq else {
            return Err(ConsumerError::Settle(
                "dead-letter queue not configured".to_string(),
            ));
        };
        let failed = FailedDelivery::new(
            delivery.routing_key.as_str(),
            reason.to_string(),
            redeliveries,
            delivery.correlation_id(),
        );
        dlq.add_failed_delivery(&delivery.data, &failed).await?;

        match dlq.count().await {
            Ok(parked) => info!(queue = %dlq.name(), parked = parked, "Dead-letter queue depth"),
            Err(e) => warn!(queue = %dlq.name(), error = %e, "Could not read dead-letter queue depth"),
        }
        Ok(())
    }
}

async fn requeue(delivery: &Delivery) -> Result<(), ConsumerError> {
    delivery
        .nack(BasicNackOptions {
            requeue: true,
            multiple: false,
        })
        .await
        .map_err(|e| ConsumerError::Settle(e.to_string()))
}

#[async_trait]
impl DeliverySink<Delivery> for AmqpSink {
    async fn settle(
        &self,
        delivery: Delivery,
        settlement: Settlement,
    ) -> Result<Settlement, ConsumerError> {
        let copied = match &settlement {
            Settlement::Ack => Ok(()),
            Settlement::Requeue => {
                requeue(&delivery).await?;
                return Ok(Settlement::Requeue);
            }
            Settlement::Retry { redeliveries } => self.republish(&delivery, *redeliveries).await,
            Settlement::DeadLetter {
                reason,
                redeliveries,
            } => self.park(&delivery, reason, *redeliveries).await,
        };

        if let Err(e) = copied {
            warn!(
                error = %e,
                settlement = ?settlement,
                routing_key = %delivery.routing_key,
                "Copy not confirmed, requeueing original"
            );
            requeue(&delivery).await?;
            return Ok(Settlement::Requeue);
        }

        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ConsumerError::Settle(e.to_string()))?;
        Ok(settlement)
    }
}

/// RabbitMQ-backed queue worker.
pub struct Consumer {
    broker: BrokerConfig,
    policy: RedeliveryPolicy,
    dead_letter_queue: String,
    tag: String,
    writer: Arc<dyn MovieWriter>,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    pub fn new(config: &AppConfig, writer: Arc<dyn MovieWriter>) -> Self {
        let (state, _) = ConsumerState::channel();
        Self {
            broker: config.broker.clone(),
            policy: RedeliveryPolicy {
                max_redeliveries: config.worker.max_redeliveries,
            },
            dead_letter_queue: config.worker.dead_letter_queue.clone(),
            tag: config.worker_name(),
            writer,
            state,
        }
    }

    /// Subscribe to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Connect, declare topology and consume until `shutdown`.
    ///
    /// Connection setup uses the broker retry policy; once it is exhausted
    /// the consumer ends in [`ConsumerState::Failed`].
    pub async fn start(&self, shutdown: ShutdownSignal) -> Result<WorkerStats, ConsumerError> {
        info!(consumer = %self.tag, queue = %self.broker.queue, "Starting consumer");
        self.state.send_replace(ConsumerState::Connecting);

        let connection = match connect(&self.broker.url, &self.broker.retry).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Consumer could not connect");
                self.state.send_replace(ConsumerState::Failed);
                return Err(e.into());
            }
        };

        let result = match connection.create_channel().await {
            Ok(channel) => {
                let result = self.consume(&channel, &shutdown).await;
                close_channel(&channel).await;
                result
            }
            Err(e) => Err(ConnectionError::Channel(e).into()),
        };
        close_connection(&connection).await;

        match &result {
            Ok(stats) => {
                self.state.send_replace(ConsumerState::Closed);
                info!(
                    consumer = %self.tag,
                    processed = stats.processed,
                    ignored = stats.ignored,
                    failed = stats.failed,
                    dead_lettered = stats.dead_lettered,
                    "Consumer stopped"
                );
            }
            Err(e) => {
                self.state.send_replace(ConsumerState::Failed);
                error!(consumer = %self.tag, error = %e, "Consumer failed");
            }
        }
        result
    }

    async fn consume(
        &self,
        channel: &Channel,
        shutdown: &ShutdownSignal,
    ) -> Result<WorkerStats, ConsumerError> {
        declare_exchange(channel, &self.broker).await?;
        declare_work_queue(channel, &self.broker).await?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(ConsumerError::Setup)?;

        let dlq = match self.policy.max_redeliveries {
            Some(_) => {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(ConsumerError::Setup)?;
                let dlq = DeadLetterQueue::declare(
                    channel.clone(),
                    &self.dead_letter_queue,
                    self.broker.confirm_timeout(),
                )
                .await?;
                Some(dlq)
            }
            None => None,
        };

        let deliveries = channel
            .basic_consume(
                &self.broker.queue,
                &self.tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ConsumerError::Setup)?;

        self.state.send_replace(ConsumerState::Consuming);
        info!(
            consumer = %self.tag,
            queue = %self.broker.queue,
            prefetch = PREFETCH_COUNT,
            max_redeliveries = ?self.policy.max_redeliveries,
            "Consuming"
        );

        let sink = AmqpSink {
            channel: channel.clone(),
            exchange: self.broker.exchange.clone(),
            dlq,
            confirm_timeout: self.broker.confirm_timeout(),
        };
        run_loop(
            deliveries,
            &sink,
            self.writer.as_ref(),
            &self.policy,
            shutdown,
            &self.state,
        )
        .await
    }
}
