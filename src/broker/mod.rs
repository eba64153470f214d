//! RabbitMQ plumbing for the asynchronous write path.
//!
//! # Topology
//!
//! ```text
//!                    movie.created ─┐
//! Publisher ──► [movies] (topic)    ├──► [movies.worker.q] ──► Consumer(s)
//!                    movie.deleted ─┘         (durable, shared)
//! ```
//!
//! The exchange and queue are durable and declared idempotently by whichever
//! side starts first. Every consumer instance binds the same queue, so
//! scaling out is a matter of starting more workers.

pub mod consumer;
pub mod memory;
pub mod publisher;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::event::Action;
use crate::retry::RetryPolicy;

pub use consumer::{Consumer, ConsumerError, ConsumerState};
pub use memory::InMemoryBroker;
pub use publisher::{EventPublisher, PublishError, Publisher};

/// Header carrying how many times a failed delivery was republished.
pub const REDELIVERY_HEADER: &str = "x-redelivery-count";

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Errors raised while bringing up a broker connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare {what}: {source}")]
    Topology {
        what: String,
        #[source]
        source: lapin::Error,
    },
}

/// Routing keys for each write action. Deployment specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKeys {
    pub created: String,
    pub deleted: String,
}

impl RoutingKeys {
    pub fn for_action(&self, action: Action) -> &str {
        match action {
            Action::Create => &self.created,
            Action::Delete => &self.deleted,
        }
    }

    pub fn all(&self) -> [&str; 2] {
        [&self.created, &self.deleted]
    }
}

impl Default for RoutingKeys {
    fn default() -> Self {
        Self {
            created: "movie.created".to_string(),
            deleted: "movie.deleted".to_string(),
        }
    }
}

/// Map a configured exchange type to lapin's representation.
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Dial the broker under the given retry policy.
pub async fn connect(url: &str, policy: &RetryPolicy) -> Result<Connection, ConnectionError> {
    let connection = policy
        .retry("rabbitmq", || {
            Connection::connect(url, ConnectionProperties::default())
        })
        .await
        .map_err(|source| ConnectionError::Unreachable {
            attempts: policy.max_attempts.max(1),
            source,
        })?;

    info!("Connected to RabbitMQ");
    Ok(connection)
}

/// Declare the durable exchange. Safe against an existing exchange with the
/// same parameters.
pub async fn declare_exchange(channel: &Channel, config: &BrokerConfig) -> Result<(), ConnectionError> {
    channel
        .exchange_declare(
            &config.exchange,
            exchange_kind(&config.exchange_kind),
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| ConnectionError::Topology {
            what: format!("exchange '{}'", config.exchange),
            source,
        })?;

    debug!(
        exchange = %config.exchange,
        kind = %config.exchange_kind,
        "Exchange declared"
    );
    Ok(())
}

/// Declare the shared work queue and bind every routing key to it.
pub async fn declare_work_queue(channel: &Channel, config: &BrokerConfig) -> Result<(), ConnectionError> {
    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| ConnectionError::Topology {
            what: format!("queue '{}'", config.queue),
            source,
        })?;

    for routing_key in config.routing_keys().all() {
        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectionError::Topology {
                what: format!("binding '{}' -> '{}'", routing_key, config.queue),
                source,
            })?;
    }

    info!(
        queue = %config.queue,
        exchange = %config.exchange,
        routing_keys = ?config.routing_keys().all(),
        "Work queue declared and bound"
    );
    Ok(())
}

/// Close a channel, ignoring one that is already gone.
pub(crate) async fn close_channel(channel: &Channel) {
    if !channel.status().connected() {
        return;
    }
    if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
        debug!(error = %e, "Channel close failed");
    }
}

/// Close a connection, ignoring one that is already gone.
pub(crate) async fn close_connection(connection: &Connection) {
    if !connection.status().connected() {
        return;
    }
    if let Err(e) = connection.close(REPLY_SUCCESS, "OK").await {
        debug!(error = %e, "Connection close failed");
    }
}

/// Read a numeric header, tolerating whichever integer width the sender used.
pub(crate) fn header_u32(headers: &Option<FieldTable>, key: &str) -> Option<u32> {
    let (_, value) = headers
        .as_ref()?
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)?;

    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_keys_for_action() {
        let keys = RoutingKeys {
            created: "film.new".to_string(),
            deleted: "film.gone".to_string(),
        };
        assert_eq!(keys.for_action(Action::Create), "film.new");
        assert_eq!(keys.for_action(Action::Delete), "film.gone");
        assert_eq!(keys.all(), ["film.new", "film.gone"]);
    }

    #[test]
    fn test_exchange_kind() {
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom(name) if name == "x-delayed-message"
        ));
    }

    #[test]
    fn test_header_u32() {
        let mut headers = FieldTable::default();
        headers.insert(REDELIVERY_HEADER.into(), AMQPValue::LongUInt(3));
        headers.insert("x-signed".into(), AMQPValue::LongLongInt(-1));
        let headers = Some(headers);

        assert_eq!(header_u32(&headers, REDELIVERY_HEADER), Some(3));
        assert_eq!(header_u32(&headers, "x-signed"), None);
        assert_eq!(header_u32(&headers, "x-missing"), None);
        assert_eq!(header_u32(&None, REDELIVERY_HEADER), None);
    }
}
