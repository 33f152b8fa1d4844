pub mod adjust;
pub mod admission;
pub mod availability;
pub mod booking;
pub mod config;
pub mod conflict;
pub mod error;
pub mod keyed_lock;
pub mod kst;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod rental_limit;
pub mod slot;
pub mod store;
pub mod sync;

pub use crate::booking::{BookingCore, Stores};
