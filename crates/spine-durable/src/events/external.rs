//! The multi-process [`EventBus`](super::EventBus) implementation (spec.md
//! §4.13: "an external pub/sub backend (multi-process)"). [`ExternalEventBus`]
//! is generic over [`ExternalTransport`] the same way
//! [`crate::scheduler::backend::TickerBackend`] is pluggable behind
//! [`crate::scheduler::SchedulerService`] — this crate ships no concrete
//! transport (Redis, NATS, a cloud pub/sub topic); a caller wires one in by
//! implementing the trait.

use std::sync::Arc;

use async_trait::async_trait;

use super::EventEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The minimal surface an external pub/sub backend must provide to back an
/// [`ExternalEventBus`]: publish a serialized envelope to a topic, and
/// deliver serialized envelopes received on subscribed topics via `on_message`.
#[async_trait]
pub trait ExternalTransport: Send + Sync + 'static {
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to `pattern` at the transport level (transports that don't
    /// support server-side glob matching subscribe to everything and the
    /// caller filters); invokes `on_message` for each delivered payload.
    async fn subscribe_raw(
        &self,
        pattern: &str,
        on_message: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
    ) -> Result<(), TransportError>;
}

/// Bridges spec.md §4.13's bus interface onto an [`ExternalTransport`],
/// serializing [`EventEnvelope`]s to JSON on the wire. Publishing is
/// fire-and-forget: a transport error is logged, never propagated to the
/// caller, matching [`super::InMemoryEventBus`]'s contract.
pub struct ExternalEventBus<T: ExternalTransport> {
    transport: Arc<T>,
}

impl<T: ExternalTransport> ExternalEventBus<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, envelope: EventEnvelope) {
        match serde_json::to_vec(&envelope.event) {
            Ok(payload) => {
                if let Err(err) = self.transport.publish_raw(&envelope.topic, payload).await {
                    tracing::warn!(topic = %envelope.topic, error = %err, "external event bus publish failed");
                }
            }
            Err(err) => {
                tracing::warn!(topic = %envelope.topic, error = %err, "failed to serialize event envelope");
            }
        }
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
        listener: Arc<dyn super::EventListener>,
    ) -> Result<(), TransportError> {
        let pattern_owned = pattern.to_string();
        let on_message = Arc::new(move |payload: Vec<u8>| {
            let listener = listener.clone();
            let pattern_owned = pattern_owned.clone();
            tokio::spawn(async move {
                match serde_json::from_slice::<crate::model::Event>(&payload) {
                    Ok(event) => {
                        let envelope = EventEnvelope {
                            topic: pattern_owned,
                            event,
                        };
                        listener.on_event(&envelope).await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to deserialize external event payload");
                    }
                }
            });
        });
        self.transport.subscribe_raw(pattern, on_message).await
    }
}
