//! Slot-based availability and booking scheduler for a caregiver marketplace.
//!
//! Specialists publish bookable slots (directly or from a weekly template),
//! parents claim them, and each booking walks a small state machine. All state
//! lives in memory per specialist and is made durable by a write-ahead log.

pub mod clock;
pub mod compactor;
pub mod config;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;

pub use engine::{Engine, SchedulerError};
