//! The reservation state machine and its transactional protocol
//!
//! Every transition runs in one storage transaction that locks the item row
//! first and the reservation row second. Transient storage failures and
//! unique-key collisions are retried internally with backoff; precondition
//! violations bubble to the caller untouched. Events publish after commit
//! and never abort the transaction they describe.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{Envelope, EventPublisher, EventType};
use crate::config::ReservationConfig;
use crate::models::{
    generate_reservation_code, Item, ItemStats, NewReservation, Page, Reservation,
    ReservationFilter, ReservationStats, ReservationStatus, StatusChange,
};
use crate::stock::StockAccountant;
use crate::storage::{StorageGateway, StorageTx};
use crate::{Error, Result};

/// Longest cancellation reason stored, prefix included
const MAX_REASON_LEN: usize = 500;

const ADMIN_REASON_PREFIX: &str = "Admin cancelled: ";

type CodeGenerator = Arc<dyn Fn(DateTime<Utc>) -> String + Send + Sync>;

/// Outcome of an expire attempt; the sweeper counts only `Expired` as work
#[derive(Debug)]
pub enum ExpireOutcome {
    /// The hold was released and the reservation marked Expired
    Expired(Reservation),
    /// Already in a terminal state; nothing to do
    AlreadyTerminal(Reservation),
    /// Deadline not yet strictly passed; left Pending
    NotYetDue(Reservation),
}

/// Owns the reservation state machine
pub struct ReservationEngine {
    gateway: Arc<dyn StorageGateway>,
    publisher: Arc<dyn EventPublisher>,
    config: ReservationConfig,
    code_generator: CodeGenerator,
}

impl ReservationEngine {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        publisher: Arc<dyn EventPublisher>,
        config: ReservationConfig,
    ) -> Self {
        Self {
            gateway,
            publisher,
            config,
            code_generator: Arc::new(generate_reservation_code),
        }
    }

    /// Swap the code source; tests use this to force collisions
    pub fn with_code_generator(mut self, generator: CodeGenerator) -> Self {
        self.code_generator = generator;
        self
    }

    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    /// Place a hold on `quantity` units for `user_id`
    pub async fn create_reservation(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<Reservation> {
        if quantity <= 0 {
            return Err(Error::validation("quantity must be positive"));
        }

        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            match self.try_create(user_id, item_id, quantity).await {
                Err(e) if self.retriable(&e, attempt) => {
                    warn!(attempt, error = %e, "create_reservation retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                other => break other?,
            }
        };

        info!(
            reservation_id = %reservation.id,
            user_id = %user_id,
            item_id = %item_id,
            quantity,
            "reservation created"
        );
        self.publish_transition(EventType::ReservationCreated, &reservation, None).await;
        Ok(reservation)
    }

    /// Owner turns a Pending hold into a sale before the deadline. A confirm
    /// at exactly `expires_at` still succeeds.
    pub async fn confirm_reservation(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
    ) -> Result<Reservation> {
        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            match self.try_confirm(user_id, reservation_id).await {
                Err(e) if self.retriable(&e, attempt) => {
                    warn!(attempt, error = %e, "confirm_reservation retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                other => break other?,
            }
        };

        info!(reservation_id = %reservation.id, user_id = %user_id, "reservation confirmed");
        self.publish_transition(EventType::ReservationConfirmed, &reservation, None).await;
        Ok(reservation)
    }

    /// Owner releases a Pending hold
    pub async fn cancel_reservation(
        &self,
        user_id: Uuid,
        reservation_id: Uuid,
        reason: Option<String>,
    ) -> Result<Reservation> {
        if let Some(reason) = &reason {
            if reason.len() > MAX_REASON_LEN {
                return Err(Error::validation("cancellation reason too long"));
            }
        }

        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            match self.try_cancel(Some(user_id), reservation_id, reason.clone()).await {
                Err(e) if self.retriable(&e, attempt) => {
                    warn!(attempt, error = %e, "cancel_reservation retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                other => break other?,
            }
        };

        info!(reservation_id = %reservation.id, user_id = %user_id, "reservation cancelled");
        self.publish_transition(EventType::ReservationCancelled, &reservation, None).await;
        Ok(reservation)
    }

    /// Admin releases any Pending hold; a non-empty reason is required and
    /// stored with an "Admin cancelled:" prefix
    pub async fn admin_cancel_reservation(
        &self,
        admin_id: Uuid,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<Reservation> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::validation("admin cancellation requires a reason"));
        }
        if reason.len() + ADMIN_REASON_PREFIX.len() > MAX_REASON_LEN {
            return Err(Error::validation("cancellation reason too long"));
        }
        let stored_reason = format!("{}{}", ADMIN_REASON_PREFIX, reason);

        let mut attempt = 0;
        let reservation = loop {
            attempt += 1;
            match self.try_cancel(None, reservation_id, Some(stored_reason.clone())).await {
                Err(e) if self.retriable(&e, attempt) => {
                    warn!(attempt, error = %e, "admin_cancel_reservation retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                other => break other?,
            }
        };

        info!(
            reservation_id = %reservation.id,
            admin_id = %admin_id,
            "reservation cancelled by admin"
        );
        self.publish_transition(EventType::ReservationCancelled, &reservation, Some(admin_id))
            .await;
        Ok(reservation)
    }

    /// Release an overdue Pending hold. Idempotent: terminal rows and rows
    /// not yet strictly past their deadline are no-ops.
    pub async fn expire_reservation(
        &self,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExpireOutcome> {
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.try_expire(reservation_id, now).await {
                Err(e) if self.retriable(&e, attempt) => {
                    warn!(attempt, error = %e, "expire_reservation retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                other => break other?,
            }
        };

        if let ExpireOutcome::Expired(reservation) = &outcome {
            info!(reservation_id = %reservation.id, "reservation expired");
            self.publish_transition(EventType::ReservationExpired, reservation, None).await;
        }
        Ok(outcome)
    }

    pub async fn list_user_reservations(
        &self,
        user_id: Uuid,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>> {
        Ok(self.gateway.list_user_reservations(user_id, status).await?)
    }

    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Page<Reservation>> {
        Ok(self.gateway.list_reservations(filter).await?)
    }

    pub async fn item_stats(&self) -> Result<ItemStats> {
        Ok(self.gateway.item_stats().await?)
    }

    pub async fn reservation_stats(&self, user_id: Option<Uuid>) -> Result<ReservationStats> {
        Ok(self.gateway.reservation_stats(user_id).await?)
    }

    fn retriable(&self, error: &Error, attempt: u32) -> bool {
        attempt < self.config.tx_attempts && (error.is_transient() || error.is_conflict())
    }

    async fn try_create(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<Reservation> {
        let now = Utc::now();
        let mut tx = self.gateway.begin().await?;

        let item = tx.lock_item(item_id).await?;
        if !item.is_on_sale(now) {
            return Err(sale_window_error(&item, now));
        }

        // Per-user cap counts Pending plus Confirmed holds
        let held = tx.sum_user_reserved(user_id, item_id).await?;
        if held + quantity as i64 > item.max_per_user as i64 {
            return Err(Error::precondition(format!(
                "per-user limit exceeded: holding {}, requesting {}, limit {}",
                held, quantity, item.max_per_user
            )));
        }

        let item = StockAccountant::reserve(tx.as_mut(), item_id, quantity, now).await?;

        let code = self.unique_code(tx.as_mut(), now).await?;
        let reservation = tx
            .insert_reservation(&NewReservation {
                user_id,
                item_id,
                quantity,
                price: item.price,
                total_price: item.price * Decimal::from(quantity),
                expires_at: now + self.config.lifetime(),
                reservation_code: code,
            })
            .await?;

        tx.commit().await?;
        Ok(reservation)
    }

    async fn unique_code(&self, tx: &mut dyn StorageTx, now: DateTime<Utc>) -> Result<String> {
        for _ in 0..self.config.code_attempts {
            let candidate = (self.code_generator)(now);
            if !tx.reservation_code_exists(&candidate).await? {
                return Ok(candidate);
            }
            warn!("reservation code collision, regenerating");
        }
        Err(Error::conflict("reservation_code"))
    }

    async fn try_confirm(&self, user_id: Uuid, reservation_id: Uuid) -> Result<Reservation> {
        let now = Utc::now();
        // Read without a lock to learn the item, then lock item before
        // reservation to keep the global lock order
        let snapshot = self.gateway.find_reservation(reservation_id).await?;

        let mut tx = self.gateway.begin().await?;
        tx.lock_item(snapshot.item_id).await?;
        let reservation = tx.lock_reservation(reservation_id).await?;

        if reservation.user_id != user_id {
            return Err(Error::forbidden("reservation belongs to another user"));
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(Error::precondition(format!(
                "reservation is {}",
                reservation.status.as_str()
            )));
        }
        if reservation.is_past_deadline(now) {
            return Err(Error::precondition("reservation has expired"));
        }

        StockAccountant::confirm(tx.as_mut(), reservation.item_id, reservation.quantity).await?;
        let updated = tx
            .update_reservation_status(reservation_id, StatusChange::confirmed(now))
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    /// Shared by owner cancel (`by` set, ownership enforced) and admin
    /// cancel (`by` empty, reason already validated and prefixed)
    async fn try_cancel(
        &self,
        by: Option<Uuid>,
        reservation_id: Uuid,
        reason: Option<String>,
    ) -> Result<Reservation> {
        let now = Utc::now();
        let snapshot = self.gateway.find_reservation(reservation_id).await?;

        let mut tx = self.gateway.begin().await?;
        tx.lock_item(snapshot.item_id).await?;
        let reservation = tx.lock_reservation(reservation_id).await?;

        if let Some(user_id) = by {
            if reservation.user_id != user_id {
                return Err(Error::forbidden("reservation belongs to another user"));
            }
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(Error::precondition(format!(
                "reservation is {}",
                reservation.status.as_str()
            )));
        }

        StockAccountant::release(tx.as_mut(), reservation.item_id, reservation.quantity).await?;
        let updated = tx
            .update_reservation_status(reservation_id, StatusChange::cancelled(now, reason))
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn try_expire(
        &self,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExpireOutcome> {
        let snapshot = self.gateway.find_reservation(reservation_id).await?;
        if snapshot.is_terminal() {
            return Ok(ExpireOutcome::AlreadyTerminal(snapshot));
        }

        let mut tx = self.gateway.begin().await?;
        tx.lock_item(snapshot.item_id).await?;
        let reservation = tx.lock_reservation(reservation_id).await?;

        // Re-check under the lock; a confirm or cancel may have won the race
        if reservation.is_terminal() {
            return Ok(ExpireOutcome::AlreadyTerminal(reservation));
        }
        if !reservation.is_past_deadline(now) {
            return Ok(ExpireOutcome::NotYetDue(reservation));
        }

        StockAccountant::release(tx.as_mut(), reservation.item_id, reservation.quantity).await?;
        let updated =
            tx.update_reservation_status(reservation_id, StatusChange::expired()).await?;

        tx.commit().await?;
        Ok(ExpireOutcome::Expired(updated))
    }

    /// Post-commit, best-effort. Failures are logged and never abort the
    /// already-committed transition.
    async fn publish_transition(
        &self,
        event_type: EventType,
        reservation: &Reservation,
        admin_id: Option<Uuid>,
    ) {
        let mut data = json!({
            "reservation_id": reservation.id,
            "reservation_code": reservation.reservation_code,
            "item_id": reservation.item_id,
            "quantity": reservation.quantity,
            "total_price": reservation.total_price,
            "status": reservation.status,
            "expires_at": reservation.expires_at,
        });
        if let Some(admin_id) = admin_id {
            data["cancelled_by"] = json!(admin_id);
        }

        let envelope = Envelope::new(event_type, reservation.user_id.to_string(), data)
            .with_user(reservation.user_id);

        if let Err(e) = self.publisher.publish(&envelope).await {
            warn!(
                reservation_id = %reservation.id,
                event_type = %event_type.routing_key(),
                error = %e,
                "failed to publish state transition event"
            );
        }
    }
}

fn sale_window_error(item: &Item, now: DateTime<Utc>) -> Error {
    if item.status != crate::models::ItemStatus::Active {
        return Error::precondition("item is not active");
    }
    if let Some(start) = item.sale_start {
        if now < start {
            return Error::precondition("sale has not started");
        }
    }
    Error::precondition("sale has ended")
}

/// Exponential backoff with jitter for internal retries
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let base = 25u64.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}
