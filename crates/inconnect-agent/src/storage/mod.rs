//! Durable slot state: SQLite database, row models, and the slot engine.

pub mod db;
pub mod models;
pub mod store;

pub use db::{Database, DatabaseError};
pub use models::{Slot, SlotCounts, SlotStatus};
pub use store::{SlotStore, StoreError};
