//! Gateway traits: the seam between the engine and its storage backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{
    Item, ItemStats, NewItem, NewReservation, Page, Reservation, ReservationFilter,
    ReservationStats, ReservationStatus, StatusChange,
};
use crate::storage::StorageResult;

/// One open transaction. Row locks acquired here are held until commit or
/// rollback; callers lock the item row before its reservation rows.
#[async_trait]
pub trait StorageTx: Send {
    /// Pessimistic-write lock on the item row. Re-locking a row already held
    /// by this transaction is a no-op returning the current view.
    async fn lock_item(&mut self, item_id: Uuid) -> StorageResult<Item>;

    /// Pessimistic-write lock on a reservation row.
    async fn lock_reservation(&mut self, reservation_id: Uuid) -> StorageResult<Reservation>;

    /// The single permitted stock mutation: one column-relative statement
    /// that shifts `stock` and `reserved_stock`, recomputes
    /// `available_stock`, and bumps `version`. Deltas are never composed in
    /// application memory.
    async fn apply_item_delta(
        &mut self,
        item_id: Uuid,
        delta_stock: i32,
        delta_reserved: i32,
    ) -> StorageResult<()>;

    async fn insert_reservation(&mut self, new: &NewReservation) -> StorageResult<Reservation>;

    async fn update_reservation_status(
        &mut self,
        reservation_id: Uuid,
        change: StatusChange,
    ) -> StorageResult<Reservation>;

    /// Sum of quantities over this user's Pending and Confirmed reservations
    /// for the item; input to the per-user cap.
    async fn sum_user_reserved(&mut self, user_id: Uuid, item_id: Uuid) -> StorageResult<i64>;

    async fn reservation_code_exists(&mut self, code: &str) -> StorageResult<bool>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Transactional storage plus the read-side queries the engine composes.
/// Reads run at read-committed; writes take explicit row locks through
/// [`StorageTx`].
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn begin(&self) -> StorageResult<Box<dyn StorageTx>>;

    /// Read-committed fetch, no lock. Used to learn a reservation's item
    /// before taking locks in item-then-reservation order.
    async fn find_reservation(&self, reservation_id: Uuid) -> StorageResult<Reservation>;

    async fn find_item(&self, item_id: Uuid) -> StorageResult<Item>;

    /// Pending reservations strictly past their deadline, oldest deadline
    /// first, capped at `limit`.
    async fn find_pending_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Reservation>>;

    async fn list_user_reservations(
        &self,
        user_id: Uuid,
        status: Option<ReservationStatus>,
    ) -> StorageResult<Vec<Reservation>>;

    async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> StorageResult<Page<Reservation>>;

    async fn item_stats(&self) -> StorageResult<ItemStats>;

    async fn reservation_stats(&self, user_id: Option<Uuid>) -> StorageResult<ReservationStats>;

    /// Admin surface: insert a new item row.
    async fn insert_item(&self, new: &NewItem) -> StorageResult<Item>;

    /// Rows whose derived `available_stock` has drifted from
    /// `stock - reserved_stock`. Operational recovery, not the hot path.
    async fn audit_stock(&self) -> StorageResult<Vec<StockDrift>>;

    /// Re-derive `available_stock` for drifted rows in one statement.
    /// Returns the number of repaired rows.
    async fn repair_stock(&self) -> StorageResult<u64>;

    /// Cheap liveness probe for health reporting.
    async fn ping(&self) -> StorageResult<()>;
}

/// One drifted item row reported by the consistency audit
#[derive(Debug, Clone, Serialize)]
pub struct StockDrift {
    pub item_id: Uuid,
    pub sku: String,
    pub stock: i32,
    pub reserved_stock: i32,
    pub available_stock: i32,
    pub expected_available: i32,
}
