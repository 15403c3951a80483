//! AMQP (RabbitMQ) event bus implementation
//!
//! One durable topic exchange carries every event. Each email routing key
//! gets its own durable queue; dead letters go to a dedicated queue via the
//! default exchange. Consumers use manual acks with a small prefetch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{
    settle, BusError, BusResult, Disposition, DlqEnvelope, Envelope, EventHandler, EventPublisher,
    EventType,
};
use crate::config::BrokerConfig;

/// Queue fed with messages that exhausted their retry budget
pub const DLQ_QUEUE: &str = "flashsale.dlq";

/// Email event types that get a durable queue of their own
pub const EMAIL_EVENTS: [EventType; 4] = [
    EventType::Verification,
    EventType::PasswordReset,
    EventType::PasswordChanged,
    EventType::AccountApproval,
];

/// Queue name for an event type's dedicated queue
pub fn queue_name(event_type: EventType) -> String {
    format!("flashsale.{}", event_type.routing_key())
}

const PUBLISH_ATTEMPTS: u32 = 3;
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// AMQP-backed event bus
pub struct AmqpEventBus {
    conn: Connection,
    config: BrokerConfig,
}

impl AmqpEventBus {
    /// Connect to the broker and declare the full topology.
    pub async fn connect(config: BrokerConfig) -> BusResult<Self> {
        let conn = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let bus = Self { conn, config };
        bus.declare_topology().await?;

        info!(exchange = %bus.config.exchange, "Connected to AMQP");
        Ok(bus)
    }

    async fn channel(&self) -> BusResult<Channel> {
        self.conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Declare exchange, per-event email queues with their bindings, and
    /// the dead-letter queue. Idempotent: declarations match or fail loud.
    async fn declare_topology(&self) -> BusResult<()> {
        let channel = self.channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        for event_type in EMAIL_EVENTS {
            let queue = queue_name(event_type);
            channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("Failed to declare queue: {}", e)))?;

            channel
                .queue_bind(
                    &queue,
                    &self.config.exchange,
                    event_type.routing_key(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("Failed to bind queue: {}", e)))?;

            debug!(queue = %queue, routing_key = %event_type.routing_key(), "Bound queue");
        }

        channel
            .queue_declare(
                DLQ_QUEUE,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare DLQ: {}", e)))?;

        Ok(())
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> BusResult<()> {
        let mut delay = Duration::from_millis(100);
        let mut last_error = None;

        for attempt in 1..=PUBLISH_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            // Fresh channel per attempt; a broken one is left behind
            let channel = match self.channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to get channel, retrying");
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2); // persistent

            match channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(exchange, routing_key, "Published event");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Publish confirmation failed, retrying");
                        last_error =
                            Some(BusError::Publish(format!("confirmation failed: {}", e)));
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "Publish failed, retrying");
                    last_error = Some(BusError::Publish(format!("publish failed: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("retries exhausted".to_string())))
    }

    /// Park a message on the dead-letter queue (default exchange, queue name
    /// as routing key).
    pub async fn publish_dlq(&self, dlq: &DlqEnvelope) -> BusResult<()> {
        let payload =
            serde_json::to_vec(dlq).map_err(|e| BusError::Serialization(e.to_string()))?;
        self.publish_raw("", DLQ_QUEUE, &payload).await
    }

    /// Spawn a consumer on `queue` feeding `handler`. Reconnects with
    /// exponential backoff; stops when `shutdown` flips to true.
    pub fn start_consumer(
        self: &Arc<Self>,
        queue: String,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);

        tokio::spawn(async move {
            let mut delay = Duration::from_millis(100);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                match bus.setup_consumer(&queue).await {
                    Ok(mut consumer) => {
                        info!(queue = %queue, "Consumer connected");
                        delay = Duration::from_millis(100);

                        loop {
                            tokio::select! {
                                delivery = consumer.next() => match delivery {
                                    Some(Ok(delivery)) => {
                                        bus.process_delivery(delivery, handler.as_ref()).await;
                                    }
                                    Some(Err(e)) => {
                                        error!(queue = %queue, error = %e, "Delivery error, reconnecting");
                                        break;
                                    }
                                    None => {
                                        info!(queue = %queue, "Consumer stream ended, reconnecting");
                                        break;
                                    }
                                },
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        info!(queue = %queue, "Consumer draining for shutdown");
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, backoff_ms = delay.as_millis() as u64, "Consumer setup failed");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        })
    }

    async fn setup_consumer(&self, queue: &str) -> BusResult<lapin::Consumer> {
        let channel = self.channel().await?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to set prefetch: {}", e)))?;

        channel
            .basic_consume(
                queue,
                "flashsale-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))
    }

    async fn process_delivery(&self, delivery: Delivery, handler: &dyn EventHandler) {
        let disposition = match Envelope::from_bytes(&delivery.data) {
            Ok(envelope) => {
                let outcome = handler.handle(&envelope).await;
                settle(envelope, outcome, self.config.max_delivery_attempts)
            }
            Err(e) => {
                warn!(error = %e, "Undecodable message, dead-lettering");
                Disposition::DeadLetter(DlqEnvelope::from_raw(&delivery.data, e.to_string()))
            }
        };

        let settled = match disposition {
            Disposition::Ack => Ok(()),
            Disposition::Requeue(envelope) => {
                debug!(
                    routing_key = %envelope.event_type.routing_key(),
                    retry_count = envelope.metadata.retry_count,
                    "Requeueing delivery"
                );
                match envelope.to_bytes() {
                    Ok(payload) => {
                        self.publish_raw(
                            &self.config.exchange,
                            envelope.event_type.routing_key(),
                            &payload,
                        )
                        .await
                    }
                    Err(e) => Err(BusError::Serialization(e.to_string())),
                }
            }
            Disposition::DeadLetter(dlq) => self.publish_dlq(&dlq).await,
        };

        match settled {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "Failed to ack delivery");
                }
            }
            Err(e) => {
                // Could not hand the message onward; let the broker redeliver
                error!(error = %e, "Failed to settle delivery, nacking for redelivery");
                if let Err(e) =
                    delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await
                {
                    error!(error = %e, "Failed to nack delivery");
                }
            }
        }
    }
}

#[async_trait]
impl EventPublisher for AmqpEventBus {
    async fn publish(&self, envelope: &Envelope) -> BusResult<()> {
        let payload =
            envelope.to_bytes().map_err(|e| BusError::Serialization(e.to_string()))?;
        self.publish_raw(&self.config.exchange, envelope.event_type.routing_key(), &payload)
            .await
    }
}
