//! Domain entities for the reservation core

pub mod item;
pub mod reservation;

pub use item::{Item, ItemStats, ItemStatus, NewItem};
pub use reservation::{
    generate_reservation_code, NewReservation, Page, Reservation, ReservationFilter,
    ReservationStats, ReservationStatus, StatusChange,
};
