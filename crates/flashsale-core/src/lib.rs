//! Flash-sale reservation core
//!
//! Sells a bounded inventory to many concurrent buyers without overselling,
//! giving each buyer a short exclusive hold before payment. The crate owns
//! the stock accounting protocol, the reservation state machine, the
//! expiration sweeper, the event fan-out with its notification workers, and
//! the admission limiter. HTTP routing, authentication and schema
//! migrations live outside and call in through [`reservation::ReservationEngine`]
//! and [`supervisor::Supervisor`].

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod limiter;
pub mod models;
pub mod notification;
pub mod reservation;
pub mod stock;
pub mod storage;
pub mod supervisor;
pub mod sweeper;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use health::{ComponentHealth, Status};
pub use models::{
    Item, ItemStats, ItemStatus, Page, Reservation, ReservationFilter, ReservationStats,
    ReservationStatus,
};
pub use reservation::{ExpireOutcome, ReservationEngine};
pub use stock::StockAccountant;
pub use storage::{MemoryGateway, PostgresGateway, StorageGateway};
pub use supervisor::{init_tracing, RunningCore, Supervisor};
pub use sweeper::{ExpirationSweeper, SweeperStats, TickSummary};

/// Current version of the core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_re_export() {
        let err = Error::validation("bad quantity");
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.category(), "validation");
    }
}
