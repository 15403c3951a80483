//! Event bus adapter: publish state-transition events, consume with
//! prefetch, bounded redelivery and a dead-letter queue

pub mod amqp;
pub mod envelope;

pub use amqp::AmqpEventBus;
pub use envelope::{DlqEnvelope, Envelope, EventMetadata, EventType};

use async_trait::async_trait;

/// Bus result type alias
pub type BusResult<T> = Result<T, BusError>;

/// Bus-specific error types
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<BusError> for crate::Error {
    fn from(err: BusError) -> Self {
        crate::Error::Bus(err.to_string())
    }
}

/// How a consumed message should be settled
#[derive(Debug)]
pub enum Disposition {
    /// Handled; acknowledge
    Ack,
    /// Handler failed retriably; republish with an incremented retry count
    Requeue(Envelope),
    /// Exhausted retries or malformed; park on the dead-letter queue
    DeadLetter(DlqEnvelope),
}

/// Handler outcome for a consumed event
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient handler failure; the delivery is retried until the
    /// configured attempt budget runs out
    #[error("retriable handler failure: {0}")]
    Retry(String),

    /// The message can never succeed (missing required fields); it goes to
    /// the DLQ immediately
    #[error("discarding message: {0}")]
    Discard(String),
}

/// Consumes events delivered from a queue
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Publishes state-transition events. Publishing is best-effort from the
/// engine's point of view: failures are logged, never propagated into the
/// committed transaction.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> BusResult<()>;
}

/// Publisher that drops events; used in tests and when the broker is down
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn publish(&self, envelope: &Envelope) -> BusResult<()> {
        tracing::debug!(event_type = %envelope.event_type.routing_key(), "event dropped (null publisher)");
        Ok(())
    }
}

/// Decide how to settle a delivery after the handler ran.
///
/// Retriable failures republish the envelope with `retry_count + 1` so the
/// attempt count survives the broker round-trip; once the count reaches
/// `max_attempts` the message is dead-lettered with the final error.
pub fn settle(
    envelope: Envelope,
    outcome: Result<(), HandlerError>,
    max_attempts: u32,
) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(HandlerError::Discard(reason)) => {
            Disposition::DeadLetter(DlqEnvelope::new(envelope, reason))
        }
        Err(HandlerError::Retry(reason)) => {
            if envelope.metadata.retry_count + 1 >= max_attempts {
                Disposition::DeadLetter(DlqEnvelope::new(envelope, reason))
            } else {
                Disposition::Requeue(envelope.next_attempt())
            }
        }
    }
}
