//! Booking lifecycle of gym classes: reserving seats, the waitlist, cancellations with
//! their penalties, and switching between classes of the same day.

extern crate alloc;

pub mod cancellation;
pub mod catalog;
pub mod clock;
pub mod error;
pub mod membership;
pub mod memory;
pub mod notify;
pub mod penalty;
pub mod policy;
pub mod registration;
pub mod service;
pub mod store;
pub mod switch;
pub mod types;
pub mod waitlist;

pub use error::{BookingError, StoreError};
pub use service::BookingService;
