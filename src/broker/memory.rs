//! In-process broker.
//!
//! Models the parts of the RabbitMQ topology the write path depends on: one
//! exchange with the two routing keys bound to a single work queue, a
//! prefetch limit on unacknowledged deliveries, requeue, republish and a
//! dead-letter list. Used to exercise publisher and consumer code without a
//! running broker.
//!
//! While publishes fail, republished and dead-lettered copies are rejected
//! too, and the original is requeued instead of acked.
//!
//! Requeued deliveries go to the back of the queue. RabbitMQ may put them
//! back near the head instead; nothing in the worker may depend on either.

use async_trait::async_trait;
use futures::Stream;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use super::consumer::{ConsumerError, DeliverySink, InboundDelivery, Settlement, PREFETCH_COUNT};
use super::publisher::{EventPublisher, PublishError};
use super::RoutingKeys;
use crate::event::Action;

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDelivery {
    pub tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub redeliveries: u32,
}

impl MemoryDelivery {
    pub fn new(tag: u64, routing_key: &str, body: Vec<u8>) -> Self {
        Self {
            tag,
            routing_key: routing_key.to_string(),
            body,
            correlation_id: None,
            redelivered: false,
            redeliveries: 0,
        }
    }
}

impl InboundDelivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn redelivery_count(&self) -> u32 {
        self.redeliveries
    }
}

/// A message accepted by the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub delivery: MemoryDelivery,
    pub reason: String,
}

#[derive(Default)]
struct State {
    queue: VecDeque<MemoryDelivery>,
    in_flight: usize,
    max_in_flight: usize,
    next_tag: u64,
    published: Vec<PublishedMessage>,
    settlements: Vec<Settlement>,
    dead_letters: Vec<DeadLetter>,
    fail_publishes: bool,
    disconnected: bool,
}

impl State {
    fn enqueue(&mut self, mut delivery: MemoryDelivery) {
        self.next_tag += 1;
        delivery.tag = self.next_tag;
        self.queue.push_back(delivery);
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    routing_keys: RoutingKeys,
    prefetch: usize,
    state: Arc<Mutex<State>>,
    changed: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new(routing_keys: RoutingKeys) -> Self {
        Self {
            routing_keys,
            prefetch: usize::from(PREFETCH_COUNT),
            state: Arc::new(Mutex::new(State::default())),
            changed: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following publish fail as if the broker nacked it.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Simulate the connection going away or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.lock().disconnected = !connected;
    }

    /// Deliveries for one consumer, honouring the prefetch limit.
    pub fn deliveries(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<MemoryDelivery, Infallible>> + Send>> {
        Box::pin(futures::stream::unfold(self.clone(), |broker| async move {
            let delivery = broker.next_delivery().await;
            Some((Ok(delivery), broker))
        }))
    }

    async fn next_delivery(&self) -> MemoryDelivery {
        // Stand-in for the network hop; keeps a requeue loop from starving
        // other tasks
        tokio::task::yield_now().await;

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = self.lock();
                if state.in_flight < self.prefetch {
                    if let Some(delivery) = state.queue.pop_front() {
                        state.in_flight += 1;
                        state.max_in_flight = state.max_in_flight.max(state.in_flight);
                        return delivery;
                    }
                }
            }

            changed.await;
        }
    }

    /// Resolve once nothing is queued or unacknowledged.
    pub async fn wait_until_idle(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let state = self.lock();
                if state.queue.is_empty() && state.in_flight == 0 {
                    return;
                }
            }

            changed.await;
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Highest number of unacknowledged deliveries seen at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn in_queue_or_flight(&self) -> usize {
        let state = self.lock();
        state.queue.len() + state.in_flight
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        correlation_id: Option<&str>,
    ) -> Result<(), PublishError> {
        {
            let mut state = self.lock();
            if state.fail_publishes {
                return Err(PublishError::Nacked {
                    routing_key: routing_key.to_string(),
                });
            }

            state.published.push(PublishedMessage {
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                correlation_id: correlation_id.map(str::to_string),
            });

            if self.routing_keys.all().contains(&routing_key) {
                let mut delivery = MemoryDelivery::new(0, routing_key, body.to_vec());
                delivery.correlation_id = correlation_id.map(str::to_string);
                state.enqueue(delivery);
            } else {
                debug!(routing_key = %routing_key, "Unroutable message dropped");
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn routing_key_for(&self, action: Action) -> &str {
        self.routing_keys.for_action(action)
    }

    fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }
}

#[async_trait]
impl DeliverySink<MemoryDelivery> for InMemoryBroker {
    async fn settle(
        &self,
        delivery: MemoryDelivery,
        settlement: Settlement,
    ) -> Result<Settlement, ConsumerError> {
        let applied = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);

            let copy_rejected = state.fail_publishes
                && matches!(
                    settlement,
                    Settlement::Retry { .. } | Settlement::DeadLetter { .. }
                );
            let applied = if copy_rejected {
                Settlement::Requeue
            } else {
                settlement
            };
            state.settlements.push(applied.clone());

            match &applied {
                Settlement::Ack => {}
                Settlement::Requeue => {
                    let mut delivery = delivery;
                    delivery.redelivered = true;
                    state.queue.push_back(delivery);
                }
                Settlement::Retry { redeliveries } => {
                    let mut delivery = delivery;
                    delivery.redelivered = false;
                    delivery.redeliveries = *redeliveries;
                    state.enqueue(delivery);
                }
                Settlement::DeadLetter { reason, .. } => {
                    state.dead_letters.push(DeadLetter {
                        delivery,
                        reason: reason.clone(),
                    });
                }
            }
            applied
        };
        self.changed.notify_waiters();
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new(RoutingKeys::default())
    }

    #[tokio::test]
    async fn test_unbound_routing_key_is_dropped() {
        let broker = broker();
        broker.publish("movie.renamed", b"{}", None).await.unwrap();

        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.in_queue_or_flight(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_second_delivery() {
        let broker = broker();
        broker.publish("movie.created", b"one", None).await.unwrap();
        broker.publish("movie.created", b"two", None).await.unwrap();

        let mut deliveries = broker.deliveries();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"one");

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), deliveries.next()).await;
        assert!(blocked.is_err());

        broker.settle(first, Settlement::Ack).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"two");
        assert_eq!(broker.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let broker = broker();
        broker
            .publish("movie.deleted", b"x", Some("c-7"))
            .await
            .unwrap();

        let mut deliveries = broker.deliveries();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        broker.settle(first, Settlement::Requeue).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.correlation_id.as_deref(), Some("c-7"));
    }

    #[tokio::test]
    async fn test_rejected_copy_requeues_original() {
        let broker = broker();
        broker.publish("movie.deleted", b"x", None).await.unwrap();
        broker.fail_publishes(true);

        let mut deliveries = broker.deliveries();
        let first = deliveries.next().await.unwrap().unwrap();
        let applied = broker
            .settle(first, Settlement::Retry { redeliveries: 1 })
            .await
            .unwrap();
        assert_eq!(applied, Settlement::Requeue);

        let second = deliveries.next().await.unwrap().unwrap();
        let applied = broker
            .settle(
                second,
                Settlement::DeadLetter {
                    reason: "boom".to_string(),
                    redeliveries: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(applied, Settlement::Requeue);

        assert!(broker.dead_letters().is_empty());
        assert_eq!(broker.in_queue_or_flight(), 1);
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.redeliveries, 0);
    }

    #[tokio::test]
    async fn test_connection_flag() {
        let broker = broker();
        assert!(broker.is_connected());
        broker.set_connected(false);
        assert!(!broker.is_connected());
    }
}
