//! Broker subscription seam.
//!
//! The durable consumer pulls `Delivery` values from an `EventSubscription`
//! and settles each one exactly once. The JetStream implementation lives in
//! `nats_broker`; `channel_subscription` is an in-process stand-in.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection to broker {url} failed: {cause}")]
    ConnectionFailed { url: String, cause: String },

    #[error("Stream {stream} unavailable: {cause}")]
    StreamUnavailable { stream: String, cause: String },

    #[error("Failed to declare consumer {consumer} on stream {stream}: {cause}")]
    ConsumerDeclarationFailed {
        stream: String,
        consumer: String,
        cause: String,
    },

    #[error("Failed to pull messages: {0}")]
    PullFailed(String),

    #[error("Failed to settle message: {0}")]
    SettleFailed(String),

    #[error("Failed to close subscription: {0}")]
    CloseFailed(String),
}

/// Default subject filter: successful, realm-scoped administrative events.
pub const DEFAULT_FILTER_SUBJECT: &str = "keycloak.event.admin.*.success.>";

/// Declarative description of the durable consumer.
///
/// Ack policy is always explicit and deliver policy always "all"; only the
/// binding varies. Deliveries are uncapped server-side: the worker decides
/// when a message is dead-lettered and terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub stream_name: String,
    pub durable_name: String,
    pub filter_subject: String,
}

impl ConsumerDefinition {
    pub fn new(
        stream_name: impl Into<String>,
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
        }
    }

    /// Narrow a `...success.>` filter to one resource type token,
    /// e.g. `user` gives `keycloak.event.admin.*.success.user`.
    pub fn scoped_to_resource(mut self, resource: &str) -> Self {
        let resource = resource.trim().to_ascii_lowercase();
        if resource.is_empty() {
            return self;
        }
        let base = self
            .filter_subject
            .strip_suffix(".>")
            .unwrap_or(&self.filter_subject)
            .to_string();
        self.filter_subject = format!("{base}.{resource}");
        self
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Negative ack, redeliver after the optional delay.
    Nak(Option<Duration>),
    /// Stop redelivering this message.
    Term,
}

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError>;
}

/// One message pulled from the durable consumer.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Delivery attempt, starting at 1.
    pub delivered: u64,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        delivered: u64,
        acker: impl DeliveryAcker + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            delivered: delivered.max(1),
            acker: Box::new(acker),
        }
    }

    pub async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError> {
        self.acker.settle(settlement).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// Ordered, effectively infinite source of deliveries.
#[async_trait]
pub trait EventSubscription: Send {
    /// Wait for the next delivery. `None` means the subscription ended.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Release the consumer handle and the connection.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

// ============================================================================
// IN-PROCESS CHANNEL SUBSCRIPTION
// ============================================================================

#[derive(Debug, Clone)]
struct QueuedMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
    delivered: u64,
}

/// Settlement observed by a channel subscription, keyed by publish sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementRecord {
    pub sequence: u64,
    pub delivered: u64,
    pub settlement: Settlement,
}

type SettlementLog = Arc<Mutex<Vec<SettlementRecord>>>;

const IDLE_POLL: Duration = Duration::from_millis(25);

/// Publishing side of a channel subscription.
///
/// Dropping every publisher ends the subscription once it is drained.
pub struct ChannelPublisher {
    tx: Option<mpsc::UnboundedSender<QueuedMessage>>,
    next_sequence: u64,
    settlements: SettlementLog,
}

impl ChannelPublisher {
    /// Queue a message and return its sequence number.
    pub fn publish(&mut self, subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> u64 {
        self.next_sequence += 1;
        let message = QueuedMessage {
            sequence: self.next_sequence,
            subject: subject.into(),
            payload: payload.into(),
            delivered: 1,
        };
        let sent = match &self.tx {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        };
        if !sent {
            tracing::warn!("Channel subscription closed, message {} discarded", self.next_sequence);
        }
        self.next_sequence
    }

    /// Stop publishing. The subscription ends once its queue is drained,
    /// while settlements stay observable here.
    pub fn finish(&mut self) {
        self.tx = None;
    }

    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.settlements
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

/// Subscription backed by an unbounded tokio channel. A NAK re-queues the
/// message at the back with its delivery count incremented.
pub struct ChannelSubscription {
    rx: mpsc::UnboundedReceiver<QueuedMessage>,
    redeliver: mpsc::UnboundedSender<QueuedMessage>,
    settlements: SettlementLog,
    closed: bool,
}

pub fn channel_subscription() -> (ChannelPublisher, ChannelSubscription) {
    let (tx, rx) = mpsc::unbounded_channel();
    let settlements: SettlementLog = Arc::new(Mutex::new(Vec::new()));
    let publisher = ChannelPublisher {
        tx: Some(tx.clone()),
        next_sequence: 0,
        settlements: Arc::clone(&settlements),
    };
    let subscription = ChannelSubscription {
        rx,
        redeliver: tx,
        settlements,
        closed: false,
    };
    (publisher, subscription)
}

struct ChannelAcker {
    message: QueuedMessage,
    redeliver: mpsc::UnboundedSender<QueuedMessage>,
    settlements: SettlementLog,
}

#[async_trait]
impl DeliveryAcker for ChannelAcker {
    async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError> {
        self.settlements
            .lock()
            .map_err(|e| BrokerError::SettleFailed(e.to_string()))?
            .push(SettlementRecord {
                sequence: self.message.sequence,
                delivered: self.message.delivered,
                settlement,
            });

        if let Settlement::Nak(_) = settlement {
            let mut retry = self.message.clone();
            retry.delivered += 1;
            self.redeliver
                .send(retry)
                .map_err(|e| BrokerError::SettleFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSubscription for ChannelSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        if self.closed {
            return None;
        }

        // The subscription keeps a sender for redelivery, so it only ends
        // once publishers are gone and nothing is queued.
        let message = loop {
            match self.rx.try_recv() {
                Ok(message) => break message,
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) if self.publishers_gone() => return None,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if let Ok(Some(message)) = timeout(IDLE_POLL, self.rx.recv()).await {
                        break message;
                    }
                }
            }
        };

        let acker = ChannelAcker {
            message: message.clone(),
            redeliver: self.redeliver.clone(),
            settlements: Arc::clone(&self.settlements),
        };
        Some(Ok(Delivery::new(
            message.subject,
            message.payload,
            message.delivered,
            acker,
        )))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        self.rx.close();
        Ok(())
    }
}

impl ChannelSubscription {
    // Only our own redelivery sender is left.
    fn publishers_gone(&self) -> bool {
        self.redeliver.strong_count() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_filter_subject() {
        let definition = ConsumerDefinition::new("stream", "durable", DEFAULT_FILTER_SUBJECT)
            .scoped_to_resource("USER");
        assert_eq!(
            definition.filter_subject,
            "keycloak.event.admin.*.success.user"
        );

        let unscoped = ConsumerDefinition::new("stream", "durable", DEFAULT_FILTER_SUBJECT)
            .scoped_to_resource("  ");
        assert_eq!(unscoped.filter_subject, DEFAULT_FILTER_SUBJECT);
    }

    #[tokio::test]
    async fn test_channel_subscription_delivers_in_order_and_ends() {
        let (mut publisher, mut subscription) = channel_subscription();
        publisher.publish("a", b"1".to_vec());
        publisher.publish("b", b"2".to_vec());
        drop(publisher);

        let first = subscription.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.subject, "a");
        assert_eq!(first.payload, b"1");
        assert_eq!(first.delivered, 1);
        first.settle(Settlement::Ack).await.unwrap();
        drop(first);

        let second = subscription.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.subject, "b");
        second.settle(Settlement::Ack).await.unwrap();
        drop(second);

        assert!(subscription.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn test_nak_requeues_with_incremented_delivery_count() {
        let (mut publisher, mut subscription) = channel_subscription();
        let sequence = publisher.publish("a", b"1".to_vec());

        let first = subscription.next_delivery().await.unwrap().unwrap();
        first.settle(Settlement::Nak(None)).await.unwrap();
        drop(first);

        let retry = subscription.next_delivery().await.unwrap().unwrap();
        assert_eq!(retry.delivered, 2);
        retry.settle(Settlement::Term).await.unwrap();

        let log = publisher.settlements();
        assert_eq!(
            log,
            vec![
                SettlementRecord {
                    sequence,
                    delivered: 1,
                    settlement: Settlement::Nak(None)
                },
                SettlementRecord {
                    sequence,
                    delivered: 2,
                    settlement: Settlement::Term
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_finish_ends_a_waiting_subscription() {
        let (mut publisher, mut subscription) = channel_subscription();

        let waiter = tokio::spawn(async move { subscription.next_delivery().await.is_none() });
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.finish();

        assert!(waiter.await.unwrap());
        assert_eq!(publisher.publish("late", b"x".to_vec()), 1);
    }
}
