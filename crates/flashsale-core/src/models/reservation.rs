//! Reservations: short exclusive holds on stock before payment
//!
//! A reservation starts Pending and moves to exactly one of Confirmed,
//! Cancelled or Expired. Terminal states are never left.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A hold on part of an item's stock
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i32,
    /// Item price snapshot taken at creation; later price changes do not
    /// alter this reservation's totals.
    pub price: Decimal,
    pub total_price: Decimal,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub reservation_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_terminal(&self) -> bool {
        self.status != ReservationStatus::Pending
    }

    /// Expired for the sweeper: strictly past the deadline. A confirm at
    /// exactly `expires_at` still succeeds.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Reservation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// Fields for inserting a new reservation row
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub total_price: Decimal,
    pub expires_at: DateTime<Utc>,
    pub reservation_code: String,
}

/// Terminal-state update applied to a locked reservation row
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub status: ReservationStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl StatusChange {
    pub fn confirmed(at: DateTime<Utc>) -> Self {
        Self {
            status: ReservationStatus::Confirmed,
            confirmed_at: Some(at),
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    pub fn cancelled(at: DateTime<Utc>, reason: Option<String>) -> Self {
        Self {
            status: ReservationStatus::Cancelled,
            confirmed_at: None,
            cancelled_at: Some(at),
            cancellation_reason: reason,
        }
    }

    pub fn expired() -> Self {
        Self {
            status: ReservationStatus::Expired,
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }
}

/// Query filter for reservation listings
#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub user_id: Option<Uuid>,
    pub item_id: Option<Uuid>,
    pub status: Option<ReservationStatus>,
    pub page: u32,
    pub per_page: u32,
}

impl ReservationFilter {
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1) * self.per_page()
    }

    pub fn per_page(&self) -> u32 {
        if self.per_page == 0 {
            20
        } else {
            self.per_page.min(100)
        }
    }
}

/// One page of results
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Reservation counts plus confirmed revenue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationStats {
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub total_revenue: Decimal,
}

/// Crockford base32 alphabet (no I, L, O, U)
const CODE_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn encode_base32(mut value: u64, width: usize, out: &mut String) {
    let mut buf = [0u8; 13];
    for slot in buf.iter_mut().take(width) {
        *slot = CODE_ALPHABET[(value & 0x1f) as usize];
        value >>= 5;
    }
    for i in (0..width).rev() {
        out.push(buf[i] as char);
    }
}

/// Generate a collision-resistant opaque reservation code: a millisecond
/// timestamp plus 8 bytes of CSPRNG entropy, base32-encoded. Collisions are
/// astronomically unlikely; the engine still probes for uniqueness and
/// regenerates on a hit.
pub fn generate_reservation_code(now: DateTime<Utc>) -> String {
    use rand::RngCore;

    let millis = now.timestamp_millis().max(0) as u64;
    let mut entropy = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut entropy);

    let mut code = String::with_capacity(24);
    encode_base32(millis, 9, &mut code);
    encode_base32(u64::from_be_bytes(entropy), 13, &mut code);
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn reservation(now: DateTime<Utc>) -> Reservation {
        Reservation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            quantity: 2,
            price: dec!(19.99),
            total_price: dec!(39.98),
            status: ReservationStatus::Pending,
            expires_at: now + Duration::minutes(15),
            confirmed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            reservation_code: generate_reservation_code(now),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_terminal_states() {
        let now = Utc::now();
        let mut res = reservation(now);
        assert!(!res.is_terminal());
        res.status = ReservationStatus::Confirmed;
        assert!(res.is_terminal());
        res.status = ReservationStatus::Expired;
        assert!(res.is_terminal());
        res.status = ReservationStatus::Cancelled;
        assert!(res.is_terminal());
    }

    #[test]
    fn test_deadline_is_exclusive() {
        let now = Utc::now();
        let mut res = reservation(now);
        res.expires_at = now;
        // now == expires_at counts as not yet expired
        assert!(!res.is_past_deadline(now));
        assert!(res.is_past_deadline(now + Duration::milliseconds(1)));
    }

    #[test]
    fn test_code_shape_and_uniqueness() {
        let now = Utc::now();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let code = generate_reservation_code(now);
            assert_eq!(code.len(), 22);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(seen.insert(code), "duplicate code generated");
        }
    }

    #[test]
    fn test_codes_sort_by_time() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(2);
        let a = generate_reservation_code(t0);
        let b = generate_reservation_code(t1);
        // Timestamp prefix keeps codes roughly time-ordered
        assert!(a[..9] <= b[..9]);
    }

    #[test]
    fn test_filter_paging_defaults() {
        let filter = ReservationFilter::default();
        assert_eq!(filter.per_page(), 20);
        assert_eq!(filter.offset(), 0);

        let filter = ReservationFilter { page: 3, per_page: 50, ..Default::default() };
        assert_eq!(filter.offset(), 100);

        let filter = ReservationFilter { page: 1, per_page: 500, ..Default::default() };
        assert_eq!(filter.per_page(), 100);
    }
}
