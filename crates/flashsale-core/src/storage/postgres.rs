//! PostgreSQL gateway implementation
//!
//! Stock-changing transactions run at Read-Committed with explicit
//! `FOR UPDATE` row locks. Lock and statement timeouts are set per
//! transaction so stuck locks surface as transient errors instead of
//! hanging the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    Item, ItemStats, ItemStatus, NewItem, NewReservation, Page, Reservation, ReservationFilter,
    ReservationStats, ReservationStatus, StatusChange,
};
use crate::storage::gateway::{StockDrift, StorageGateway, StorageTx};
use crate::storage::{StorageError, StorageResult};

/// PostgreSQL database handle
#[derive(Clone)]
pub struct PostgresDb {
    pool: Pool<Postgres>,
}

impl PostgresDb {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// Create PostgreSQL connection pool
pub async fn create_pool(url: &str, pool_size: u32) -> StorageResult<Pool<Postgres>> {
    tracing::info!(pool_size, "Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await?;

    tracing::info!("PostgreSQL connected successfully");
    Ok(pool)
}

/// Postgres-backed storage gateway
pub struct PostgresGateway {
    db: PostgresDb,
    tx_deadline: Duration,
}

impl PostgresGateway {
    pub fn new(db: PostgresDb, tx_deadline: Duration) -> Self {
        Self { db, tx_deadline }
    }
}

#[async_trait]
impl StorageGateway for PostgresGateway {
    async fn begin(&self) -> StorageResult<Box<dyn StorageTx>> {
        let mut tx = self.db.pool().begin().await?;

        // Bound every stock-changing transaction; lock waits past the
        // deadline surface as 55P03 and are retried by the engine.
        let millis = self.tx_deadline.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", millis))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL lock_timeout = {}", millis))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PostgresTx { tx }))
    }

    async fn find_reservation(&self, reservation_id: Uuid) -> StorageResult<Reservation> {
        sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(reservation_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| StorageError::NotFound("reservation".to_string()))
    }

    async fn find_item(&self, item_id: Uuid) -> StorageResult<Item> {
        sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = $1 AND deleted_at IS NULL")
            .bind(item_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StorageError::NotFound("item".to_string()))
    }

    async fn find_pending_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT * FROM reservations
            WHERE status = 'pending' AND expires_at < $1 AND deleted_at IS NULL
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    async fn list_user_reservations(
        &self,
        user_id: Uuid,
        status: Option<ReservationStatus>,
    ) -> StorageResult<Vec<Reservation>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, Reservation>(
                    r#"
                    SELECT * FROM reservations
                    WHERE user_id = $1 AND status = $2 AND deleted_at IS NULL
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(user_id)
                .bind(status)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Reservation>(
                    r#"
                    SELECT * FROM reservations
                    WHERE user_id = $1 AND deleted_at IS NULL
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(user_id)
                .fetch_all(self.db.pool())
                .await?
            }
        };

        Ok(rows)
    }

    async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> StorageResult<Page<Reservation>> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) FROM reservations WHERE deleted_at IS NULL",
        );
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.db.pool()).await?;

        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT * FROM reservations WHERE deleted_at IS NULL",
        );
        push_filter(&mut query, filter);
        query.push(" ORDER BY created_at DESC LIMIT ");
        query.push_bind(filter.per_page() as i64);
        query.push(" OFFSET ");
        query.push_bind(filter.offset() as i64);

        let items = query
            .build_query_as::<Reservation>()
            .fetch_all(self.db.pool())
            .await?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: filter.page.max(1),
            per_page: filter.per_page(),
        })
    }

    async fn item_stats(&self) -> StorageResult<ItemStats> {
        let rows = sqlx::query_as::<_, (ItemStatus, i64)>(
            "SELECT status, COUNT(*) FROM items WHERE deleted_at IS NULL GROUP BY status",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut stats = ItemStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            match status {
                ItemStatus::Active => stats.active = count,
                ItemStatus::Inactive => stats.inactive = count,
                ItemStatus::OutOfStock => stats.out_of_stock = count,
            }
        }
        Ok(stats)
    }

    async fn reservation_stats(&self, user_id: Option<Uuid>) -> StorageResult<ReservationStats> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, (ReservationStatus, i64, rust_decimal::Decimal)>(
                    r#"
                    SELECT status, COUNT(*), COALESCE(SUM(total_price), 0)
                    FROM reservations
                    WHERE user_id = $1 AND deleted_at IS NULL
                    GROUP BY status
                    "#,
                )
                .bind(user_id)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, (ReservationStatus, i64, rust_decimal::Decimal)>(
                    r#"
                    SELECT status, COUNT(*), COALESCE(SUM(total_price), 0)
                    FROM reservations
                    WHERE deleted_at IS NULL
                    GROUP BY status
                    "#,
                )
                .fetch_all(self.db.pool())
                .await?
            }
        };

        let mut stats = ReservationStats::default();
        for (status, count, revenue) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            match status {
                ReservationStatus::Pending => stats.pending = count,
                ReservationStatus::Confirmed => {
                    stats.confirmed = count;
                    stats.total_revenue = revenue;
                }
                ReservationStatus::Cancelled => stats.cancelled = count,
                ReservationStatus::Expired => stats.expired = count,
            }
        }
        Ok(stats)
    }

    async fn insert_item(&self, new: &NewItem) -> StorageResult<Item> {
        let item = sqlx::query_as::<_, Item>(
            r#"
            INSERT INTO items
            (id, sku, name, price, original_price, stock, reserved_stock, available_stock,
             status, image_url, sale_start, sale_end, max_per_user, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $6, $7, $8, $9, $10, $11, 1, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.sku)
        .bind(&new.name)
        .bind(new.price)
        .bind(new.original_price)
        .bind(new.stock)
        .bind(new.status)
        .bind(&new.image_url)
        .bind(new.sale_start)
        .bind(new.sale_end)
        .bind(new.max_per_user)
        .fetch_one(self.db.pool())
        .await?;

        Ok(item)
    }

    async fn audit_stock(&self) -> StorageResult<Vec<StockDrift>> {
        let rows = sqlx::query_as::<_, (Uuid, String, i32, i32, i32)>(
            r#"
            SELECT id, sku, stock, reserved_stock, available_stock
            FROM items
            WHERE available_stock <> stock - reserved_stock AND deleted_at IS NULL
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(item_id, sku, stock, reserved_stock, available_stock)| StockDrift {
                item_id,
                sku,
                stock,
                reserved_stock,
                available_stock,
                expected_available: stock - reserved_stock,
            })
            .collect())
    }

    async fn repair_stock(&self) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE items
            SET available_stock = stock - reserved_stock,
                version = version + 1,
                updated_at = NOW()
            WHERE available_stock <> stock - reserved_stock AND deleted_at IS NULL
            "#,
        )
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").fetch_one(self.db.pool()).await?;
        Ok(())
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &ReservationFilter) {
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ");
        builder.push_bind(user_id);
    }
    if let Some(item_id) = filter.item_id {
        builder.push(" AND item_id = ");
        builder.push_bind(item_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status);
    }
}

/// One open Postgres transaction
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn lock_item(&mut self, item_id: Uuid) -> StorageResult<Item> {
        sqlx::query_as::<_, Item>(
            "SELECT * FROM items WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(item_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StorageError::NotFound("item".to_string()))
    }

    async fn lock_reservation(&mut self, reservation_id: Uuid) -> StorageResult<Reservation> {
        sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(reservation_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StorageError::NotFound("reservation".to_string()))
    }

    async fn apply_item_delta(
        &mut self,
        item_id: Uuid,
        delta_stock: i32,
        delta_reserved: i32,
    ) -> StorageResult<()> {
        // Column-relative so concurrent transactions never lose updates;
        // available_stock is re-derived from the post-delta columns in the
        // same statement.
        let result = sqlx::query(
            r#"
            UPDATE items
            SET stock = stock + $2,
                reserved_stock = reserved_stock + $3,
                available_stock = (stock + $2) - (reserved_stock + $3),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(item_id)
        .bind(delta_stock)
        .bind(delta_reserved)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound("item".to_string()));
        }
        Ok(())
    }

    async fn insert_reservation(&mut self, new: &NewReservation) -> StorageResult<Reservation> {
        let reservation = sqlx::query_as::<_, Reservation>(
            r#"
            INSERT INTO reservations
            (id, user_id, item_id, quantity, price, total_price, status,
             expires_at, reservation_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.item_id)
        .bind(new.quantity)
        .bind(new.price)
        .bind(new.total_price)
        .bind(new.expires_at)
        .bind(&new.reservation_code)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(reservation)
    }

    async fn update_reservation_status(
        &mut self,
        reservation_id: Uuid,
        change: StatusChange,
    ) -> StorageResult<Reservation> {
        sqlx::query_as::<_, Reservation>(
            r#"
            UPDATE reservations
            SET status = $2,
                confirmed_at = $3,
                cancelled_at = $4,
                cancellation_reason = $5,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(reservation_id)
        .bind(change.status)
        .bind(change.confirmed_at)
        .bind(change.cancelled_at)
        .bind(&change.cancellation_reason)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StorageError::NotFound("reservation".to_string()))
    }

    async fn sum_user_reserved(&mut self, user_id: Uuid, item_id: Uuid) -> StorageResult<i64> {
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)
            FROM reservations
            WHERE user_id = $1 AND item_id = $2
              AND status IN ('pending', 'confirmed')
              AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(sum)
    }

    async fn reservation_code_exists(&mut self, code: &str) -> StorageResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM reservations WHERE reservation_code = $1)",
        )
        .bind(code)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
