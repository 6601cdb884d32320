/// NATS JetStream Connection Manager
///
/// Owns the broker connection and the declarative, create-or-update
/// definition of the durable pull consumer that feeds the sync worker.
///
/// Architecture:
/// ```text
/// identity provider ──▶ JetStream stream ──▶ durable consumer ──▶ NatsSubscription
///                                              (explicit ack, deliver all)
/// ```
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    AckKind,
};
use async_trait::async_trait;
use futures::StreamExt;

use crate::broker::{
    BrokerError, ConsumerDefinition, Delivery, DeliveryAcker, EventSubscription, Settlement,
};

pub struct ConnectionManager {
    url: String,
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl ConnectionManager {
    /// Connect to the broker. Failure here is fatal to the worker.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::ConnectionFailed {
                url: url.to_string(),
                cause: e.to_string(),
            })?;

        tracing::info!("Connected to NATS at {}", url);

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            url: url.to_string(),
            client,
            jetstream,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Create or update the durable consumer and start pulling from it.
    ///
    /// Safe to repeat on every start: an existing consumer with the same
    /// name resumes from its last acknowledged position.
    pub async fn declare_consumer(
        &self,
        definition: &ConsumerDefinition,
    ) -> Result<NatsSubscription, BrokerError> {
        tracing::info!(
            "Creating/updating JetStream consumer {} on stream {} (filter {})",
            definition.durable_name,
            definition.stream_name,
            definition.filter_subject
        );

        let stream = self
            .jetstream
            .get_stream(&definition.stream_name)
            .await
            .map_err(|e| BrokerError::StreamUnavailable {
                stream: definition.stream_name.clone(),
                cause: e.to_string(),
            })?;

        let declaration_failed = |cause: String| BrokerError::ConsumerDeclarationFailed {
            stream: definition.stream_name.clone(),
            consumer: definition.durable_name.clone(),
            cause,
        };

        let consumer: PullConsumer = stream
            .create_consumer(consumer_config(definition))
            .await
            .map_err(|e| declaration_failed(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| declaration_failed(e.to_string()))?;

        tracing::info!("JetStream consumer {} ready", definition.durable_name);

        Ok(NatsSubscription {
            client: self.client.clone(),
            consumer_name: definition.durable_name.clone(),
            messages: Some(messages),
        })
    }
}

fn consumer_config(definition: &ConsumerDefinition) -> pull::Config {
    pull::Config {
        name: Some(definition.durable_name.clone()),
        durable_name: Some(definition.durable_name.clone()),
        filter_subject: definition.filter_subject.clone(),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: DeliverPolicy::All,
        ..Default::default()
    }
}

/// Pull subscription on the durable consumer.
pub struct NatsSubscription {
    client: async_nats::Client,
    consumer_name: String,
    messages: Option<pull::Stream>,
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl DeliveryAcker for NatsAcker {
    async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError> {
        let kind = match settlement {
            Settlement::Ack => AckKind::Ack,
            Settlement::Nak(delay) => AckKind::Nak(delay),
            Settlement::Term => AckKind::Term,
        };

        self.message
            .ack_with(kind)
            .await
            .map_err(|e| BrokerError::SettleFailed(e.to_string()))
    }
}

#[async_trait]
impl EventSubscription for NatsSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let messages = self.messages.as_mut()?;

        match messages.next().await? {
            Ok(message) => {
                let delivered = message
                    .info()
                    .map(|info| info.delivered.max(1) as u64)
                    .unwrap_or(1);
                let subject = message.subject.to_string();
                let payload = message.payload.to_vec();

                Some(Ok(Delivery::new(
                    subject,
                    payload,
                    delivered,
                    NatsAcker { message },
                )))
            }
            Err(e) => Some(Err(BrokerError::PullFailed(e.to_string()))),
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        // Dropping the stream stops outstanding pull requests.
        self.messages = None;

        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::CloseFailed(e.to_string()))?;

        tracing::info!("Released JetStream consumer {}", self.consumer_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DEFAULT_FILTER_SUBJECT;

    #[test]
    fn test_consumer_config_is_durable_explicit_ack_deliver_all() {
        let definition = ConsumerDefinition::new(
            "keycloak-admin-event-stream",
            "user-service-consumer",
            DEFAULT_FILTER_SUBJECT,
        );

        let config = consumer_config(&definition);
        assert_eq!(config.durable_name.as_deref(), Some("user-service-consumer"));
        assert_eq!(config.name.as_deref(), Some("user-service-consumer"));
        assert_eq!(config.filter_subject, DEFAULT_FILTER_SUBJECT);
        assert!(matches!(config.ack_policy, AckPolicy::Explicit));
        assert!(matches!(config.deliver_policy, DeliverPolicy::All));
        // Unset means unlimited on the server.
        assert_eq!(config.max_deliver, 0);
    }
}
