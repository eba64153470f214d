//! Publisher side of the write path.
//!
//! One long-lived connection and channel per gateway process. The channel is
//! put in confirm mode so a publish only counts once the broker has taken
//! responsibility for the message.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel, Connection};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    close_channel, close_connection, connect, declare_exchange, ConnectionError, RoutingKeys,
};
use crate::config::BrokerConfig;
use crate::event::{Action, EnvelopeError, MovieCommand};

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish failed: {0}")]
    Channel(#[source] lapin::Error),

    #[error("broker rejected message for '{routing_key}'")]
    Nacked { routing_key: String },

    #[error("no queue bound for '{routing_key}'")]
    Unroutable { routing_key: String },

    #[error("channel is not in confirm mode, '{routing_key}' unconfirmed")]
    Unconfirmed { routing_key: String },

    #[error("no broker confirmation within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Anything that can put an encoded envelope on the exchange.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `body` under `routing_key`. Succeeds once the broker confirms.
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError>;

    fn routing_key_for(&self, action: Action) -> &str;

    /// Whether the broker connection is up. Drives readiness.
    fn is_connected(&self) -> bool;

    /// Encode `command` and publish it under its action's routing key.
    async fn publish_command(
        &self,
        command: &MovieCommand,
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        let body = command.encode()?;
        let routing_key = self.routing_key_for(command.action()).to_string();
        self.publish(&routing_key, &body, correlation_id).await
    }
}

/// RabbitMQ publisher with confirms.
pub struct Publisher {
    connection: Connection,
    channel: Mutex<Channel>,
    exchange: String,
    routing_keys: RoutingKeys,
    confirm_timeout: Duration,
}

impl Publisher {
    /// Connect under the configured retry policy, declare the exchange and
    /// enable confirms. Nothing is left open if any step fails.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let connection = connect(&config.url, &config.retry).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(ConnectionError::Channel(e));
            }
        };

        let setup = async {
            declare_exchange(&channel, config).await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(ConnectionError::Channel)
        };
        if let Err(e) = setup.await {
            error!(error = %e, "Publisher setup failed");
            close_channel(&channel).await;
            close_connection(&connection).await;
            return Err(e);
        }

        info!(
            exchange = %config.exchange,
            kind = %config.exchange_kind,
            "Publisher ready"
        );

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            exchange: config.exchange.clone(),
            routing_keys: config.routing_keys(),
            confirm_timeout: config.confirm_timeout(),
        })
    }

    /// Close channel then connection. Calling it twice is harmless.
    pub async fn close(&self) {
        let channel = self.channel.lock().await;
        close_channel(&channel).await;
        close_connection(&self.connection).await;
        info!("Publisher closed");
    }
}

/// Run `publish` under `deadline`. Waiting for the channel counts.
pub(crate) async fn confirm_within<T, F>(deadline: Duration, publish: F) -> Result<T, PublishError>
where
    F: Future<Output = lapin::Result<T>>,
{
    tokio::time::timeout(deadline, publish)
        .await
        .map_err(|_| PublishError::Timeout(deadline))?
        .map_err(PublishError::Channel)
}

/// Only a plain broker ack means the message reached a queue.
pub(crate) fn require_ack(routing_key: &str, confirmation: Confirmation) -> Result<(), PublishError> {
    let routing_key = routing_key.to_string();
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(PublishError::Unroutable { routing_key }),
        Confirmation::Nack(_) => Err(PublishError::Nacked { routing_key }),
        Confirmation::NotRequested => Err(PublishError::Unconfirmed { routing_key }),
    }
}

async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    options: BasicPublishOptions,
    body: &[u8],
    properties: BasicProperties,
) -> lapin::Result<Confirmation> {
    channel
        .basic_publish(exchange, routing_key, options, body, properties)
        .await?
        .await
}

/// Publish with `mandatory` set on a confirm-mode channel and wait for the
/// broker to take the message.
pub(crate) async fn publish_mandatory(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
    deadline: Duration,
) -> Result<(), PublishError> {
    let options = BasicPublishOptions {
        mandatory: true,
        ..BasicPublishOptions::default()
    };
    let confirmation = confirm_within(
        deadline,
        publish_confirmed(channel, exchange, routing_key, options, body, properties),
    )
    .await?;
    require_ack(routing_key, confirmation)
}

/// Properties every envelope is published with.
pub fn envelope_properties(correlation_id: Option<&str>) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(PERSISTENT);

    match correlation_id {
        Some(id) => properties.with_correlation_id(id.into()),
        None => properties,
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        // Publishes and their confirms are serialized on the one channel
        let confirmation = confirm_within(self.confirm_timeout, async {
            let channel = self.channel.lock().await;
            publish_confirmed(
                &channel,
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                envelope_properties(correlation_id),
            )
            .await
        })
        .await?;

        if let Err(e) = require_ack(routing_key, confirmation) {
            error!(routing_key = %routing_key, error = %e, "Broker did not accept message");
            return Err(e);
        }

        debug!(
            exchange = %self.exchange,
            routing_key = %routing_key,
            correlation_id = correlation_id.unwrap_or("-"),
            bytes = body.len(),
            "Message published"
        );
        Ok(())
    }

    fn routing_key_for(&self, action: Action) -> &str {
        self.routing_keys.for_action(action)
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}
