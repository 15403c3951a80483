//! Reservation lifecycle engine

pub mod engine;

pub use engine::{ExpireOutcome, ReservationEngine};
