//! Stock accounting: the three atomic operations that move units between
//! the available and reserved buckets
//!
//! Every operation locks the item row before reading its counts, validates
//! against the locked view, and applies exactly one column-relative delta.
//! The coupling `available_stock = stock - reserved_stock` holds at every
//! commit because the delta statement re-derives it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::Item;
use crate::storage::{StockDrift, StorageGateway, StorageTx};
use crate::{Error, Result};

/// Atomic stock operations, run inside a caller-owned transaction
pub struct StockAccountant;

impl StockAccountant {
    /// Hold `quantity` units: moves them from available to reserved.
    /// Returns the pre-delta item view for price snapshotting.
    pub async fn reserve(
        tx: &mut dyn StorageTx,
        item_id: uuid::Uuid,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<Item> {
        debug_assert!(quantity > 0);

        let item = tx.lock_item(item_id).await?;

        if !item.is_on_sale(now) {
            return Err(Error::precondition("item is not available for sale"));
        }
        if item.available_stock < quantity {
            return Err(Error::InsufficientStock {
                available: item.available_stock,
                requested: quantity,
            });
        }

        tx.apply_item_delta(item_id, 0, quantity).await?;
        Ok(item)
    }

    /// Release `quantity` held units back to available. A release can never
    /// push counts negative: an over-release clamps to the held amount and
    /// the anomaly is logged.
    pub async fn release(
        tx: &mut dyn StorageTx,
        item_id: uuid::Uuid,
        quantity: i32,
    ) -> Result<i32> {
        debug_assert!(quantity > 0);

        let item = tx.lock_item(item_id).await?;

        let released = quantity.min(item.reserved_stock);
        if released < quantity {
            warn!(
                item_id = %item_id,
                requested = quantity,
                reserved = item.reserved_stock,
                "release clamped to reserved stock"
            );
        }
        if released > 0 {
            tx.apply_item_delta(item_id, 0, -released).await?;
        }
        Ok(released)
    }

    /// Turn `quantity` held units into a sale: both the reserved bucket and
    /// total stock shrink together.
    pub async fn confirm(
        tx: &mut dyn StorageTx,
        item_id: uuid::Uuid,
        quantity: i32,
    ) -> Result<()> {
        debug_assert!(quantity > 0);

        let item = tx.lock_item(item_id).await?;

        if item.reserved_stock < quantity {
            return Err(Error::precondition(format!(
                "reserved stock shortfall: held {}, confirming {}",
                item.reserved_stock, quantity
            )));
        }
        if item.stock < quantity {
            return Err(Error::precondition(format!(
                "stock shortfall: total {}, confirming {}",
                item.stock, quantity
            )));
        }

        tx.apply_item_delta(item_id, -quantity, -quantity).await?;
        Ok(())
    }

    /// Scan for rows whose derived count drifted. Operational recovery from
    /// external writes, not part of the hot path.
    pub async fn audit(gateway: &Arc<dyn StorageGateway>) -> Result<Vec<StockDrift>> {
        let drifted = gateway.audit_stock().await?;
        if !drifted.is_empty() {
            warn!(rows = drifted.len(), "stock consistency audit found drifted rows");
        }
        Ok(drifted)
    }

    /// Re-derive `available_stock` for every drifted row.
    pub async fn repair(gateway: &Arc<dyn StorageGateway>) -> Result<u64> {
        let repaired = gateway.repair_stock().await?;
        if repaired > 0 {
            info!(rows = repaired, "repaired drifted stock rows");
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemStatus, NewItem};
    use crate::storage::MemoryGateway;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn seed(gw: &MemoryGateway, stock: i32, status: ItemStatus) -> Item {
        gw.insert_item(&NewItem {
            sku: format!("SKU-{}", Uuid::new_v4()),
            name: "Widget".to_string(),
            price: dec!(25.00),
            original_price: None,
            stock,
            status,
            image_url: None,
            sale_start: None,
            sale_end: None,
            max_per_user: 10,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_reserve_moves_units_to_reserved() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 10, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        let view = StockAccountant::reserve(tx.as_mut(), item.id, 4, Utc::now()).await.unwrap();
        assert_eq!(view.available_stock, 10);
        tx.commit().await.unwrap();

        let after = gw.find_item(item.id).await.unwrap();
        assert_eq!(after.reserved_stock, 4);
        assert_eq!(after.available_stock, 6);
        assert_eq!(after.stock, 10);
    }

    #[tokio::test]
    async fn test_reserve_insufficient_stock() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 3, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        let err =
            StockAccountant::reserve(tx.as_mut(), item.id, 4, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientStock { available: 3, requested: 4 }));
    }

    #[tokio::test]
    async fn test_reserve_exact_available_succeeds() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 5, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        assert!(StockAccountant::reserve(tx.as_mut(), item.id, 5, Utc::now()).await.is_ok());
        tx.commit().await.unwrap();
        assert_eq!(gw.find_item(item.id).await.unwrap().available_stock, 0);
    }

    #[tokio::test]
    async fn test_reserve_inactive_item() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 10, ItemStatus::Inactive).await;

        let mut tx = gw.begin().await.unwrap();
        let err =
            StockAccountant::reserve(tx.as_mut(), item.id, 1, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_reserve_outside_sale_window() {
        let gw = MemoryGateway::new();
        let now = Utc::now();
        let item = gw
            .insert_item(&NewItem {
                sku: "WINDOWED".to_string(),
                name: "Widget".to_string(),
                price: dec!(25.00),
                original_price: None,
                stock: 10,
                status: ItemStatus::Active,
                image_url: None,
                sale_start: Some(now + Duration::hours(1)),
                sale_end: Some(now + Duration::hours(2)),
                max_per_user: 10,
            })
            .await
            .unwrap();

        let mut tx = gw.begin().await.unwrap();
        let err = StockAccountant::reserve(tx.as_mut(), item.id, 1, now).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_reserve_missing_item() {
        let gw = MemoryGateway::new();
        let mut tx = gw.begin().await.unwrap();
        let err = StockAccountant::reserve(tx.as_mut(), Uuid::new_v4(), 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_restores_available() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 10, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        StockAccountant::reserve(tx.as_mut(), item.id, 6, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = gw.begin().await.unwrap();
        let released = StockAccountant::release(tx.as_mut(), item.id, 6).await.unwrap();
        assert_eq!(released, 6);
        tx.commit().await.unwrap();

        let after = gw.find_item(item.id).await.unwrap();
        assert_eq!(after.reserved_stock, 0);
        assert_eq!(after.available_stock, 10);
    }

    #[tokio::test]
    async fn test_release_clamps_to_reserved() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 10, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        StockAccountant::reserve(tx.as_mut(), item.id, 2, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = gw.begin().await.unwrap();
        let released = StockAccountant::release(tx.as_mut(), item.id, 5).await.unwrap();
        assert_eq!(released, 2);
        tx.commit().await.unwrap();

        let after = gw.find_item(item.id).await.unwrap();
        assert_eq!(after.reserved_stock, 0);
        assert!(after.counts_consistent());
    }

    #[tokio::test]
    async fn test_confirm_shrinks_stock_and_reserved() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 10, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        StockAccountant::reserve(tx.as_mut(), item.id, 3, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = gw.begin().await.unwrap();
        StockAccountant::confirm(tx.as_mut(), item.id, 3).await.unwrap();
        tx.commit().await.unwrap();

        let after = gw.find_item(item.id).await.unwrap();
        assert_eq!(after.stock, 7);
        assert_eq!(after.reserved_stock, 0);
        assert_eq!(after.available_stock, 7);
    }

    #[tokio::test]
    async fn test_confirm_reserved_shortfall() {
        let gw = MemoryGateway::new();
        let item = seed(&gw, 10, ItemStatus::Active).await;

        let mut tx = gw.begin().await.unwrap();
        let err = StockAccountant::confirm(tx.as_mut(), item.id, 1).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }
}
