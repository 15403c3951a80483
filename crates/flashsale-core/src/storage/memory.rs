//! In-memory storage gateway
//!
//! Backs the engine tests and standalone runs with the same contract as the
//! Postgres gateway: per-row pessimistic locks held for the life of a
//! transaction, staged writes applied atomically at commit, and the single
//! column-relative delta as the only stock mutation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{
    Item, ItemStats, ItemStatus, NewItem, NewReservation, Page, Reservation, ReservationFilter,
    ReservationStats, ReservationStatus, StatusChange,
};
use crate::storage::gateway::{StockDrift, StorageGateway, StorageTx};
use crate::storage::{StorageError, StorageResult};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct MemoryStore {
    items: StdMutex<HashMap<Uuid, Item>>,
    reservations: StdMutex<HashMap<Uuid, Reservation>>,
    item_locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    reservation_locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl MemoryStore {
    fn item_lock(&self, item_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.item_locks.lock().unwrap();
        locks.entry(item_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    fn reservation_lock(&self, reservation_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.reservation_locks.lock().unwrap();
        locks
            .entry(reservation_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// In-process storage gateway; clones share the same store
#[derive(Clone)]
pub struct MemoryGateway {
    store: Arc<MemoryStore>,
    lock_timeout: Duration,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            store: Arc::new(MemoryStore {
                items: StdMutex::new(HashMap::new()),
                reservations: StdMutex::new(HashMap::new()),
                item_locks: StdMutex::new(HashMap::new()),
                reservation_locks: StdMutex::new(HashMap::new()),
            }),
            lock_timeout,
        }
    }

    /// Direct read for assertions in tests
    pub fn item_snapshot(&self, item_id: Uuid) -> Option<Item> {
        self.store.items.lock().unwrap().get(&item_id).cloned()
    }

    /// Direct read for assertions in tests
    pub fn reservation_snapshot(&self, reservation_id: Uuid) -> Option<Reservation> {
        self.store.reservations.lock().unwrap().get(&reservation_id).cloned()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

enum Staged {
    ItemDelta { item_id: Uuid, delta_stock: i32, delta_reserved: i32 },
    InsertReservation(Reservation),
    UpdateReservation { reservation_id: Uuid, change: StatusChange },
}

struct MemoryTx {
    store: Arc<MemoryStore>,
    lock_timeout: Duration,
    item_guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    reservation_guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    staged: Vec<Staged>,
}

impl MemoryTx {
    async fn acquire(
        lock: Arc<AsyncMutex<()>>,
        timeout: Duration,
    ) -> StorageResult<OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| StorageError::Transient("row lock timeout".to_string()))
    }

    /// Committed item with this transaction's staged deltas folded in
    fn item_view(&self, item_id: Uuid) -> StorageResult<Item> {
        let items = self.store.items.lock().unwrap();
        let mut item = items
            .get(&item_id)
            .filter(|i| i.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| StorageError::NotFound("item".to_string()))?;
        drop(items);

        for staged in &self.staged {
            if let Staged::ItemDelta { item_id: id, delta_stock, delta_reserved } = staged {
                if *id == item_id {
                    apply_delta(&mut item, *delta_stock, *delta_reserved);
                }
            }
        }
        Ok(item)
    }

    /// Committed reservation with this transaction's staged writes folded in
    fn reservation_view(&self, reservation_id: Uuid) -> StorageResult<Reservation> {
        let committed = self
            .store
            .reservations
            .lock()
            .unwrap()
            .get(&reservation_id)
            .filter(|r| r.deleted_at.is_none())
            .cloned();

        let mut row = committed;
        for staged in &self.staged {
            match staged {
                Staged::InsertReservation(res) if res.id == reservation_id => {
                    row = Some(res.clone());
                }
                Staged::UpdateReservation { reservation_id: id, change }
                    if *id == reservation_id =>
                {
                    if let Some(res) = row.as_mut() {
                        apply_change(res, change, Utc::now());
                    }
                }
                _ => {}
            }
        }
        row.ok_or_else(|| StorageError::NotFound("reservation".to_string()))
    }

    fn effective_reservations(&self) -> Vec<Reservation> {
        let mut rows: HashMap<Uuid, Reservation> = self
            .store
            .reservations
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .map(|r| (r.id, r))
            .collect();

        for staged in &self.staged {
            match staged {
                Staged::InsertReservation(res) => {
                    rows.insert(res.id, res.clone());
                }
                Staged::UpdateReservation { reservation_id, change } => {
                    if let Some(res) = rows.get_mut(reservation_id) {
                        apply_change(res, change, Utc::now());
                    }
                }
                Staged::ItemDelta { .. } => {}
            }
        }
        rows.into_values().collect()
    }
}

fn apply_delta(item: &mut Item, delta_stock: i32, delta_reserved: i32) {
    item.stock += delta_stock;
    item.reserved_stock += delta_reserved;
    item.available_stock = item.stock - item.reserved_stock;
    item.version += 1;
    item.updated_at = Utc::now();
}

fn apply_change(res: &mut Reservation, change: &StatusChange, now: DateTime<Utc>) {
    res.status = change.status;
    res.confirmed_at = change.confirmed_at;
    res.cancelled_at = change.cancelled_at;
    res.cancellation_reason = change.cancellation_reason.clone();
    res.updated_at = now;
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn lock_item(&mut self, item_id: Uuid) -> StorageResult<Item> {
        if !self.item_guards.contains_key(&item_id) {
            let lock = self.store.item_lock(item_id);
            let guard = Self::acquire(lock, self.lock_timeout).await?;
            self.item_guards.insert(item_id, guard);
        }
        self.item_view(item_id)
    }

    async fn lock_reservation(&mut self, reservation_id: Uuid) -> StorageResult<Reservation> {
        if !self.reservation_guards.contains_key(&reservation_id) {
            let lock = self.store.reservation_lock(reservation_id);
            let guard = Self::acquire(lock, self.lock_timeout).await?;
            self.reservation_guards.insert(reservation_id, guard);
        }
        self.reservation_view(reservation_id)
    }

    async fn apply_item_delta(
        &mut self,
        item_id: Uuid,
        delta_stock: i32,
        delta_reserved: i32,
    ) -> StorageResult<()> {
        // Mirrors the SQL contract: the row must exist, the delta is staged
        // relative to whatever is committed at apply time.
        self.item_view(item_id)?;
        self.staged.push(Staged::ItemDelta { item_id, delta_stock, delta_reserved });
        Ok(())
    }

    async fn insert_reservation(&mut self, new: &NewReservation) -> StorageResult<Reservation> {
        if self.reservation_code_exists(&new.reservation_code).await? {
            return Err(StorageError::Conflict("reservation_code".to_string()));
        }

        let now = Utc::now();
        let reservation = Reservation {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            item_id: new.item_id,
            quantity: new.quantity,
            price: new.price,
            total_price: new.total_price,
            status: ReservationStatus::Pending,
            expires_at: new.expires_at,
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            reservation_code: new.reservation_code.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.staged.push(Staged::InsertReservation(reservation.clone()));
        Ok(reservation)
    }

    async fn update_reservation_status(
        &mut self,
        reservation_id: Uuid,
        change: StatusChange,
    ) -> StorageResult<Reservation> {
        let mut updated = self.reservation_view(reservation_id)?;
        apply_change(&mut updated, &change, Utc::now());
        self.staged.push(Staged::UpdateReservation { reservation_id, change });
        Ok(updated)
    }

    async fn sum_user_reserved(&mut self, user_id: Uuid, item_id: Uuid) -> StorageResult<i64> {
        let sum = self
            .effective_reservations()
            .iter()
            .filter(|r| {
                r.user_id == user_id
                    && r.item_id == item_id
                    && matches!(
                        r.status,
                        ReservationStatus::Pending | ReservationStatus::Confirmed
                    )
            })
            .map(|r| r.quantity as i64)
            .sum();
        Ok(sum)
    }

    async fn reservation_code_exists(&mut self, code: &str) -> StorageResult<bool> {
        Ok(self.effective_reservations().iter().any(|r| r.reservation_code == code))
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut items = self.store.items.lock().unwrap();
        let mut reservations = self.store.reservations.lock().unwrap();

        // Uniqueness is re-checked at commit; concurrent transactions may
        // have staged the same code before either committed.
        for staged in &staged {
            if let Staged::InsertReservation(res) = staged {
                if reservations.values().any(|r| r.reservation_code == res.reservation_code) {
                    return Err(StorageError::Conflict("reservation_code".to_string()));
                }
            }
        }

        for staged in staged {
            match staged {
                Staged::ItemDelta { item_id, delta_stock, delta_reserved } => {
                    if let Some(item) = items.get_mut(&item_id) {
                        apply_delta(item, delta_stock, delta_reserved);
                    }
                }
                Staged::InsertReservation(res) => {
                    reservations.insert(res.id, res);
                }
                Staged::UpdateReservation { reservation_id, change } => {
                    if let Some(res) = reservations.get_mut(&reservation_id) {
                        apply_change(res, &change, Utc::now());
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        // Staged writes are discarded; row guards release on drop
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn begin(&self) -> StorageResult<Box<dyn StorageTx>> {
        Ok(Box::new(MemoryTx {
            store: self.store.clone(),
            lock_timeout: self.lock_timeout,
            item_guards: HashMap::new(),
            reservation_guards: HashMap::new(),
            staged: Vec::new(),
        }))
    }

    async fn find_reservation(&self, reservation_id: Uuid) -> StorageResult<Reservation> {
        self.store
            .reservations
            .lock()
            .unwrap()
            .get(&reservation_id)
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| StorageError::NotFound("reservation".to_string()))
    }

    async fn find_item(&self, item_id: Uuid) -> StorageResult<Item> {
        self.store
            .items
            .lock()
            .unwrap()
            .get(&item_id)
            .filter(|i| i.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| StorageError::NotFound("item".to_string()))
    }

    async fn find_pending_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Reservation>> {
        let mut rows: Vec<Reservation> = self
            .store
            .reservations
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.deleted_at.is_none()
                    && r.status == ReservationStatus::Pending
                    && r.expires_at < now
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.expires_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_user_reservations(
        &self,
        user_id: Uuid,
        status: Option<ReservationStatus>,
    ) -> StorageResult<Vec<Reservation>> {
        let mut rows: Vec<Reservation> = self
            .store
            .reservations
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.deleted_at.is_none()
                    && r.user_id == user_id
                    && status.map_or(true, |s| r.status == s)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> StorageResult<Page<Reservation>> {
        let mut rows: Vec<Reservation> = self
            .store
            .reservations
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.deleted_at.is_none()
                    && filter.user_id.map_or(true, |u| r.user_id == u)
                    && filter.item_id.map_or(true, |i| r.item_id == i)
                    && filter.status.map_or(true, |s| r.status == s)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.per_page() as usize)
            .collect();

        Ok(Page { items, total, page: filter.page.max(1), per_page: filter.per_page() })
    }

    async fn item_stats(&self) -> StorageResult<ItemStats> {
        let mut stats = ItemStats::default();
        for item in self.store.items.lock().unwrap().values() {
            if item.deleted_at.is_some() {
                continue;
            }
            stats.total += 1;
            match item.status {
                ItemStatus::Active => stats.active += 1,
                ItemStatus::Inactive => stats.inactive += 1,
                ItemStatus::OutOfStock => stats.out_of_stock += 1,
            }
        }
        Ok(stats)
    }

    async fn reservation_stats(&self, user_id: Option<Uuid>) -> StorageResult<ReservationStats> {
        let mut stats = ReservationStats::default();
        for res in self.store.reservations.lock().unwrap().values() {
            if res.deleted_at.is_some() || user_id.map_or(false, |u| res.user_id != u) {
                continue;
            }
            stats.total += 1;
            match res.status {
                ReservationStatus::Pending => stats.pending += 1,
                ReservationStatus::Confirmed => {
                    stats.confirmed += 1;
                    stats.total_revenue += res.total_price;
                }
                ReservationStatus::Cancelled => stats.cancelled += 1,
                ReservationStatus::Expired => stats.expired += 1,
            }
        }
        Ok(stats)
    }

    async fn insert_item(&self, new: &NewItem) -> StorageResult<Item> {
        new.validate().map_err(StorageError::Integrity)?;

        let mut items = self.store.items.lock().unwrap();
        if items.values().any(|i| i.sku == new.sku && i.deleted_at.is_none()) {
            return Err(StorageError::Conflict("sku".to_string()));
        }

        let now = Utc::now();
        let item = Item {
            id: Uuid::new_v4(),
            sku: new.sku.clone(),
            name: new.name.clone(),
            price: new.price,
            original_price: new.original_price,
            stock: new.stock,
            reserved_stock: 0,
            available_stock: new.stock,
            status: new.status,
            image_url: new.image_url.clone(),
            sale_start: new.sale_start,
            sale_end: new.sale_end,
            max_per_user: new.max_per_user,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn audit_stock(&self) -> StorageResult<Vec<StockDrift>> {
        Ok(self
            .store
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.deleted_at.is_none() && i.available_stock != i.stock - i.reserved_stock)
            .map(|i| StockDrift {
                item_id: i.id,
                sku: i.sku.clone(),
                stock: i.stock,
                reserved_stock: i.reserved_stock,
                available_stock: i.available_stock,
                expected_available: i.stock - i.reserved_stock,
            })
            .collect())
    }

    async fn repair_stock(&self) -> StorageResult<u64> {
        let mut repaired = 0;
        for item in self.store.items.lock().unwrap().values_mut() {
            if item.deleted_at.is_none() && item.available_stock != item.stock - item.reserved_stock
            {
                item.available_stock = item.stock - item.reserved_stock;
                item.version += 1;
                item.updated_at = Utc::now();
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_item(stock: i32) -> NewItem {
        NewItem {
            sku: format!("SKU-{}", Uuid::new_v4()),
            name: "Widget".to_string(),
            price: dec!(10.00),
            original_price: None,
            stock,
            status: ItemStatus::Active,
            image_url: None,
            sale_start: None,
            sale_end: None,
            max_per_user: 10,
        }
    }

    fn new_reservation(item: &Item, user_id: Uuid, qty: i32) -> NewReservation {
        NewReservation {
            user_id,
            item_id: item.id,
            quantity: qty,
            price: item.price,
            total_price: item.price * rust_decimal::Decimal::from(qty),
            expires_at: Utc::now() + chrono::Duration::minutes(15),
            reservation_code: crate::models::generate_reservation_code(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_delta_commit_updates_counts() {
        let gw = MemoryGateway::new();
        let item = gw.insert_item(&new_item(10)).await.unwrap();

        let mut tx = gw.begin().await.unwrap();
        tx.lock_item(item.id).await.unwrap();
        tx.apply_item_delta(item.id, 0, 3).await.unwrap();
        tx.commit().await.unwrap();

        let after = gw.find_item(item.id).await.unwrap();
        assert_eq!(after.reserved_stock, 3);
        assert_eq!(after.available_stock, 7);
        assert_eq!(after.stock, 10);
        assert_eq!(after.version, 2);
        assert!(after.counts_consistent());
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let gw = MemoryGateway::new();
        let item = gw.insert_item(&new_item(10)).await.unwrap();

        let mut tx = gw.begin().await.unwrap();
        tx.lock_item(item.id).await.unwrap();
        tx.apply_item_delta(item.id, 0, 5).await.unwrap();
        tx.insert_reservation(&new_reservation(&item, Uuid::new_v4(), 5)).await.unwrap();
        tx.rollback().await.unwrap();

        let after = gw.find_item(item.id).await.unwrap();
        assert_eq!(after.reserved_stock, 0);
        assert_eq!(gw.reservation_stats(None).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_transaction() {
        let gw = MemoryGateway::with_lock_timeout(Duration::from_millis(50));
        let item = gw.insert_item(&new_item(10)).await.unwrap();

        let mut tx1 = gw.begin().await.unwrap();
        tx1.lock_item(item.id).await.unwrap();

        let mut tx2 = gw.begin().await.unwrap();
        let err = tx2.lock_item(item.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Transient(_)));

        drop(tx1);
        let mut tx3 = gw.begin().await.unwrap();
        assert!(tx3.lock_item(item.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_relock_within_transaction_is_reentrant() {
        let gw = MemoryGateway::new();
        let item = gw.insert_item(&new_item(10)).await.unwrap();

        let mut tx = gw.begin().await.unwrap();
        tx.lock_item(item.id).await.unwrap();
        tx.apply_item_delta(item.id, 0, 2).await.unwrap();
        // Second lock returns the in-transaction view
        let view = tx.lock_item(item.id).await.unwrap();
        assert_eq!(view.reserved_stock, 2);
        assert_eq!(view.available_stock, 8);
    }

    #[tokio::test]
    async fn test_sum_user_reserved_sees_staged_insert() {
        let gw = MemoryGateway::new();
        let item = gw.insert_item(&new_item(10)).await.unwrap();
        let user = Uuid::new_v4();

        let mut tx = gw.begin().await.unwrap();
        tx.lock_item(item.id).await.unwrap();
        assert_eq!(tx.sum_user_reserved(user, item.id).await.unwrap(), 0);
        tx.insert_reservation(&new_reservation(&item, user, 4)).await.unwrap();
        assert_eq!(tx.sum_user_reserved(user, item.id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_sku_conflicts() {
        let gw = MemoryGateway::new();
        let mut new = new_item(5);
        new.sku = "SAME".to_string();
        gw.insert_item(&new).await.unwrap();
        let err = gw.insert_item(&new).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_audit_and_repair() {
        let gw = MemoryGateway::new();
        let item = gw.insert_item(&new_item(10)).await.unwrap();

        // Force drift from outside the delta protocol
        gw.store.items.lock().unwrap().get_mut(&item.id).unwrap().available_stock = 99;

        let drift = gw.audit_stock().await.unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].expected_available, 10);

        assert_eq!(gw.repair_stock().await.unwrap(), 1);
        assert!(gw.audit_stock().await.unwrap().is_empty());
        assert!(gw.find_item(item.id).await.unwrap().counts_consistent());
    }

    #[tokio::test]
    async fn test_find_pending_expired_strict_cutoff() {
        let gw = MemoryGateway::new();
        let item = gw.insert_item(&new_item(10)).await.unwrap();
        let now = Utc::now();

        let mut tx = gw.begin().await.unwrap();
        let mut exact = new_reservation(&item, Uuid::new_v4(), 1);
        exact.expires_at = now;
        tx.insert_reservation(&exact).await.unwrap();
        let mut past = new_reservation(&item, Uuid::new_v4(), 1);
        past.expires_at = now - chrono::Duration::seconds(1);
        tx.insert_reservation(&past).await.unwrap();
        tx.commit().await.unwrap();

        // Strictly < now: the row expiring exactly at `now` is not returned
        let due = gw.find_pending_expired(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].expires_at, past.expires_at);
    }
}
