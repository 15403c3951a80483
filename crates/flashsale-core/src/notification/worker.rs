//! The consumer-side worker: envelope in, rendered email out
//!
//! Malformed payloads are discarded straight to the DLQ. Transport failures
//! are retriable and ride the bus's redelivery budget. Repeated deliveries
//! of the same `event_id` are dropped.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Envelope, EventHandler, HandlerError};
use crate::notification::{EmailPayload, MailTransport, TemplateRegistry};

/// How many handled event ids are remembered for idempotence
const SEEN_CAPACITY: usize = 1024;

/// Bounded set of recently handled event ids
struct SeenEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenEvents {
    fn new() -> Self {
        Self { order: VecDeque::with_capacity(SEEN_CAPACITY), ids: HashSet::new() }
    }

    /// Record `id`; false when it was already present
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id);
        true
    }
}

/// Handles consumed email events
pub struct NotificationWorker {
    templates: TemplateRegistry,
    mailer: Arc<dyn MailTransport>,
    seen: Mutex<SeenEvents>,
}

impl NotificationWorker {
    pub fn new(templates: TemplateRegistry, mailer: Arc<dyn MailTransport>) -> Self {
        Self { templates, mailer, seen: Mutex::new(SeenEvents::new()) }
    }
}

#[async_trait]
impl EventHandler for NotificationWorker {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        // Idempotence: a redelivered event we already handled is a success
        if let Some(event_id) = envelope.metadata.event_id {
            if !self.seen.lock().unwrap().insert(event_id) {
                debug!(event_id = %event_id, "duplicate delivery dropped");
                return Ok(());
            }
        }

        let payload = match EmailPayload::from_envelope(envelope) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                // Not an email event; nothing for this worker
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, to = %envelope.to, "malformed email payload");
                return Err(HandlerError::Discard(e.to_string()));
            }
        };

        let email = self
            .templates
            .render(&payload)
            .map_err(|e| HandlerError::Discard(format!("render failed: {}", e)))?;

        match self.mailer.send(&envelope.to, &email).await {
            Ok(()) => {
                info!(to = %envelope.to, subject = %email.subject, "notification sent");
                Ok(())
            }
            Err(e) => {
                // Let the redelivery budget absorb transport hiccups, but
                // forget the id so the retry is not dropped as a duplicate
                if let Some(event_id) = envelope.metadata.event_id {
                    let mut seen = self.seen.lock().unwrap();
                    seen.ids.remove(&event_id);
                    seen.order.retain(|id| *id != event_id);
                }
                warn!(to = %envelope.to, error = %e, "dispatch failed, will retry");
                Err(HandlerError::Retry(e.to_string()))
            }
        }
    }
}
