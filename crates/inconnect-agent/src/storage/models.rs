//! Row models for the slot store.

use serde::{Deserialize, Serialize};

/// A single allocation entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Slot {
    pub slot_id: i64,
    pub shard_id: i64,
    pub password: String,
    pub status: String,
    pub user_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-status slot counts for one shard (or the whole fleet).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub free: i64,
    pub used: i64,
    pub reserved: i64,
}

/// Slot lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Used,
    Reserved,
}

impl SlotStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Used => "used",
            Self::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
