//! Flash-sale items and their stock counts
//!
//! Stock is tracked as three coupled columns: `stock` (sellable units),
//! `reserved_stock` (held by pending reservations) and `available_stock`
//! (derived, `stock - reserved_stock`). The columns change only through
//! single-statement relative deltas issued by the storage gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A sellable item
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub stock: i32,
    pub reserved_stock: i32,
    pub available_stock: i32,
    pub status: ItemStatus,
    pub image_url: Option<String>,
    pub sale_start: Option<DateTime<Utc>>,
    pub sale_end: Option<DateTime<Utc>>,
    pub max_per_user: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Check whether the sale window is open at `now`. Items without a
    /// window boundary are open on that side.
    pub fn in_sale_window(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.sale_start {
            if now < start {
                return false;
            }
        }
        if let Some(end) = self.sale_end {
            if now > end {
                return false;
            }
        }
        true
    }

    /// Active and inside the sale window
    pub fn is_on_sale(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Active && self.in_sale_window(now)
    }

    /// Stock invariant: `available_stock = stock - reserved_stock`
    pub fn counts_consistent(&self) -> bool {
        self.available_stock == self.stock - self.reserved_stock
            && self.stock >= 0
            && self.reserved_stock >= 0
            && self.available_stock >= 0
    }
}

/// Item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "item_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    Inactive,
    OutOfStock,
}

/// Fields for creating an item (admin surface)
#[derive(Debug, Clone)]
pub struct NewItem {
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub stock: i32,
    pub status: ItemStatus,
    pub image_url: Option<String>,
    pub sale_start: Option<DateTime<Utc>>,
    pub sale_end: Option<DateTime<Utc>>,
    pub max_per_user: i32,
}

impl NewItem {
    pub fn validate(&self) -> Result<(), String> {
        if self.sku.trim().is_empty() {
            return Err("sku must not be empty".to_string());
        }
        if self.price < Decimal::ZERO {
            return Err("price must be non-negative".to_string());
        }
        if self.stock < 0 {
            return Err("stock must be non-negative".to_string());
        }
        if self.max_per_user <= 0 {
            return Err("max_per_user must be positive".to_string());
        }
        if let (Some(start), Some(end)) = (self.sale_start, self.sale_end) {
            if end <= start {
                return Err("sale_end must be after sale_start".to_string());
            }
        }
        Ok(())
    }
}

/// Item counts by status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemStats {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub out_of_stock: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn item(now: DateTime<Utc>) -> Item {
        Item {
            id: Uuid::new_v4(),
            sku: "FS-001".to_string(),
            name: "Widget".to_string(),
            price: dec!(19.99),
            original_price: Some(dec!(29.99)),
            stock: 10,
            reserved_stock: 2,
            available_stock: 8,
            status: ItemStatus::Active,
            image_url: None,
            sale_start: Some(now - Duration::hours(1)),
            sale_end: Some(now + Duration::hours(1)),
            max_per_user: 5,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_sale_window() {
        let now = Utc::now();
        let mut it = item(now);
        assert!(it.is_on_sale(now));

        it.sale_start = Some(now + Duration::minutes(5));
        assert!(!it.is_on_sale(now));

        it.sale_start = None;
        it.sale_end = Some(now - Duration::minutes(5));
        assert!(!it.is_on_sale(now));

        it.sale_end = None;
        assert!(it.is_on_sale(now));
    }

    #[test]
    fn test_inactive_is_not_on_sale() {
        let now = Utc::now();
        let mut it = item(now);
        it.status = ItemStatus::Inactive;
        assert!(!it.is_on_sale(now));
        it.status = ItemStatus::OutOfStock;
        assert!(!it.is_on_sale(now));
    }

    #[test]
    fn test_counts_consistent() {
        let now = Utc::now();
        let mut it = item(now);
        assert!(it.counts_consistent());
        it.available_stock = 9;
        assert!(!it.counts_consistent());
    }

    #[test]
    fn test_new_item_validation() {
        let now = Utc::now();
        let mut new = NewItem {
            sku: "FS-002".to_string(),
            name: "Gadget".to_string(),
            price: dec!(9.99),
            original_price: None,
            stock: 100,
            status: ItemStatus::Active,
            image_url: None,
            sale_start: Some(now),
            sale_end: Some(now + Duration::hours(2)),
            max_per_user: 3,
        };
        assert!(new.validate().is_ok());

        new.max_per_user = 0;
        assert!(new.validate().is_err());
        new.max_per_user = 3;

        new.sale_end = Some(now - Duration::hours(2));
        assert!(new.validate().is_err());
    }
}
