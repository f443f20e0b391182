//! The slot engine: transactional allocate / reserve / rotate over the
//! sharded slot table, plus per-shard server PSK management.
//!
//! Every write runs inside a SQLite transaction on the single writer
//! connection; SQLite's serializable isolation plus the post-update
//! row-count check give at-most-once allocation.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use sqlx::{Sqlite, Transaction};
use tracing::info;

use inconnect_core::db::unix_timestamp;
use inconnect_core::secret::generate_secret;

use crate::config::{AllocationStrategy, ShardDefinition};

use super::db::{Database, DatabaseError};
use super::models::{Slot, SlotCounts, SlotStatus};

const SERVER_PSK_PREFIX: &str = "server_psk_shard_";
const LEGACY_SERVER_PSK_KEY: &str = "server_psk";

/// Slot engine errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no free slots")]
    NoFreePorts,

    #[error("slot not found")]
    SlotNotFound,

    #[error("slot already reserved")]
    SlotReserved,

    #[error("slot is free")]
    SlotFree,

    #[error("slot not in use")]
    SlotNotInUse,

    /// Conditional update hit 0 rows; the caller may retry.
    #[error("slot allocation conflict")]
    Conflict,

    #[error("expected {expected} slots for shard {shard_id}, found {found}")]
    ShapeMismatch {
        shard_id: i64,
        expected: i64,
        found: i64,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(DatabaseError::from(e))
    }
}

pub struct SlotStore {
    db: Database,
    shards: Vec<ShardDefinition>,
    strategy: AllocationStrategy,
    /// Populated at init, read-only afterwards (reset repopulates).
    server_passwords: RwLock<HashMap<i64, String>>,
    /// Next shard index tried by the round-robin policy.
    rr_cursor: Mutex<usize>,
}

impl SlotStore {
    pub fn new(db: Database, shards: Vec<ShardDefinition>, strategy: AllocationStrategy) -> Self {
        Self {
            db,
            shards,
            strategy,
            server_passwords: RwLock::new(HashMap::new()),
            rr_cursor: Mutex::new(0),
        }
    }

    pub fn shards(&self) -> &[ShardDefinition] {
        &self.shards
    }

    /// Seed missing slot rows and ensure per-shard server PSKs exist.
    /// Idempotent; existing rows and keys are left untouched.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.ensure_slots().await?;
        self.ensure_server_passwords().await
    }

    async fn ensure_slots(&self) -> Result<(), StoreError> {
        let total: i64 = self.shards.iter().map(|s| s.slot_count).sum();
        let now = unix_timestamp();

        let mut tx = self.db.pool().begin().await?;
        for slot_id in 1..=total {
            sqlx::query(
                "INSERT INTO slots (slot_id, password, status, created_at, updated_at, shard_id)
                 VALUES (?, ?, ?, ?, ?, 1)
                 ON CONFLICT(slot_id) DO NOTHING",
            )
            .bind(slot_id)
            .bind(generate_secret())
            .bind(SlotStatus::Free.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        // Shard ranges are contiguous in declaration order.
        let mut offset = 0i64;
        for shard in &self.shards {
            let start = offset + 1;
            let end = offset + shard.slot_count;
            sqlx::query("UPDATE slots SET shard_id = ? WHERE slot_id BETWEEN ? AND ?")
                .bind(shard.id)
                .bind(start)
                .bind(end)
                .execute(&mut *tx)
                .await?;
            offset = end;
        }
        tx.commit().await?;

        info!(total, shards = self.shards.len(), "Slot table seeded");
        Ok(())
    }

    async fn ensure_server_passwords(&self) -> Result<(), StoreError> {
        for shard in &self.shards {
            let key = format!("{SERVER_PSK_PREFIX}{}", shard.id);
            let legacy = (shard.id == 1).then_some(LEGACY_SERVER_PSK_KEY);
            let psk = self.ensure_server_password(&key, legacy).await?;
            self.server_passwords
                .write()
                .expect("server password cache poisoned")
                .insert(shard.id, psk);
        }
        Ok(())
    }

    async fn ensure_server_password(
        &self,
        key: &str,
        legacy: Option<&str>,
    ) -> Result<String, StoreError> {
        if let Some(value) = self.metadata_value(key).await? {
            return Ok(value);
        }

        // Single-container deployments stored one PSK under the legacy key;
        // adopt it for shard 1 so existing clients keep working.
        if let Some(legacy_key) = legacy {
            if let Some(value) = self.metadata_value(legacy_key).await? {
                self.upsert_metadata(key, &value).await?;
                return Ok(value);
            }
        }

        let psk = generate_secret();
        self.upsert_metadata(key, &psk).await?;
        Ok(psk)
    }

    async fn metadata_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(value)
    }

    async fn upsert_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metadata (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(unix_timestamp())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// The server PSK for a shard. In-memory lookup, no I/O; empty when the
    /// shard is unknown.
    pub fn server_password(&self, shard_id: i64) -> String {
        self.server_passwords
            .read()
            .expect("server password cache poisoned")
            .get(&shard_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Allocate a free slot according to the configured policy.
    ///
    /// One transaction: pick the candidate row, flip it FREE -> USED with a
    /// status-guarded update, and treat 0 affected rows as a conflict.
    pub async fn allocate(&self, user_id: Option<&str>) -> Result<Slot, StoreError> {
        let mut tx = self.db.pool().begin().await?;

        let Some(slot_id) = self.select_free(&mut tx).await? else {
            return Err(StoreError::NoFreePorts);
        };

        let user_value = user_id.filter(|u| !u.is_empty());
        let result = sqlx::query(
            "UPDATE slots SET status = ?, user_id = ?, updated_at = ?
             WHERE slot_id = ? AND status = ?",
        )
        .bind(SlotStatus::Used.as_str())
        .bind(user_value)
        .bind(unix_timestamp())
        .bind(slot_id)
        .bind(SlotStatus::Free.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        let slot = sqlx::query_as::<_, Slot>(
            "SELECT slot_id, shard_id, password, status, user_id, created_at, updated_at
             FROM slots WHERE slot_id = ?",
        )
        .bind(slot_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(slot)
    }

    /// Row selection per allocation policy: the id of the chosen FREE row.
    async fn select_free(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
    ) -> Result<Option<i64>, StoreError> {
        match self.strategy {
            AllocationStrategy::Sequential => {
                let row = sqlx::query_scalar::<_, i64>(
                    "SELECT slot_id FROM slots WHERE status = ? ORDER BY slot_id LIMIT 1",
                )
                .bind(SlotStatus::Free.as_str())
                .fetch_optional(&mut **tx)
                .await?;
                Ok(row)
            }
            AllocationStrategy::RoundRobin => {
                let count = self.shards.len();
                if count == 0 {
                    return Ok(None);
                }
                let start = *self.rr_cursor.lock().expect("cursor poisoned");
                for step in 0..count {
                    let idx = (start + step) % count;
                    let row = sqlx::query_scalar::<_, i64>(
                        "SELECT slot_id FROM slots
                         WHERE status = ? AND shard_id = ? ORDER BY slot_id LIMIT 1",
                    )
                    .bind(SlotStatus::Free.as_str())
                    .bind(self.shards[idx].id)
                    .fetch_optional(&mut **tx)
                    .await?;
                    if row.is_some() {
                        *self.rr_cursor.lock().expect("cursor poisoned") = (idx + 1) % count;
                        return Ok(row);
                    }
                }
                Ok(None)
            }
            AllocationStrategy::LeastFree => {
                let row = sqlx::query_scalar::<_, i64>(
                    "SELECT slot_id FROM slots
                     WHERE status = ? AND shard_id = (
                         SELECT shard_id FROM slots WHERE status = ?
                         GROUP BY shard_id ORDER BY COUNT(*) DESC, shard_id ASC LIMIT 1)
                     ORDER BY slot_id LIMIT 1",
                )
                .bind(SlotStatus::Free.as_str())
                .bind(SlotStatus::Free.as_str())
                .fetch_optional(&mut **tx)
                .await?;
                Ok(row)
            }
        }
    }

    /// Mark a USED slot RESERVED (released by its user, pending rotation).
    pub async fn reserve(&self, slot_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE slots SET status = ?, user_id = NULL, updated_at = ?
             WHERE slot_id = ? AND status = ?",
        )
        .bind(SlotStatus::Reserved.as_str())
        .bind(unix_timestamp())
        .bind(slot_id)
        .bind(SlotStatus::Used.as_str())
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        // 0 rows affected: re-read to report why.
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM slots WHERE slot_id = ?")
            .bind(slot_id)
            .fetch_optional(self.db.pool())
            .await?;
        match status.as_deref() {
            None => Err(StoreError::SlotNotFound),
            Some("free") => Err(StoreError::SlotFree),
            Some("reserved") => Err(StoreError::SlotReserved),
            Some(_) => Err(StoreError::SlotNotInUse),
        }
    }

    /// Regenerate passwords of all RESERVED slots in a shard and return
    /// them to the FREE pool. Returns the number of slots rotated.
    pub async fn rotate_reserved(&self, shard_id: i64) -> Result<i64, StoreError> {
        let mut tx = self.db.pool().begin().await?;

        let slot_ids = sqlx::query_scalar::<_, i64>(
            "SELECT slot_id FROM slots WHERE status = ? AND shard_id = ? ORDER BY slot_id",
        )
        .bind(SlotStatus::Reserved.as_str())
        .bind(shard_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut count = 0i64;
        for slot_id in slot_ids {
            sqlx::query("UPDATE slots SET password = ?, status = ?, updated_at = ? WHERE slot_id = ?")
                .bind(generate_secret())
                .bind(SlotStatus::Free.as_str())
                .bind(unix_timestamp())
                .bind(slot_id)
                .execute(&mut *tx)
                .await?;
            count += 1;
        }
        tx.commit().await?;

        Ok(count)
    }

    /// All slots of a shard ordered by id. The row count must match the
    /// shard definition; anything else means the store and the topology
    /// have diverged and the reconcile cycle must not proceed.
    pub async fn slots_by_shard(&self, shard_id: i64, expected: i64) -> Result<Vec<Slot>, StoreError> {
        let slots = sqlx::query_as::<_, Slot>(
            "SELECT slot_id, shard_id, password, status, user_id, created_at, updated_at
             FROM slots WHERE shard_id = ? ORDER BY slot_id LIMIT ?",
        )
        .bind(shard_id)
        .bind(expected)
        .fetch_all(self.db.pool())
        .await?;

        if slots.len() as i64 != expected {
            return Err(StoreError::ShapeMismatch {
                shard_id,
                expected,
                found: slots.len() as i64,
            });
        }
        Ok(slots)
    }

    /// Per-shard and global counts grouped by status.
    pub async fn slot_stats(&self) -> Result<(HashMap<i64, SlotCounts>, SlotCounts), StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, i64)>(
            "SELECT shard_id, status, COUNT(*) FROM slots GROUP BY shard_id, status",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut by_shard: HashMap<i64, SlotCounts> = HashMap::new();
        let mut totals = SlotCounts::default();
        for (shard_id, status, count) in rows {
            let counts = by_shard.entry(shard_id).or_default();
            match status.as_str() {
                "free" => {
                    counts.free += count;
                    totals.free += count;
                }
                "used" => {
                    counts.used += count;
                    totals.used += count;
                }
                "reserved" => {
                    counts.reserved += count;
                    totals.reserved += count;
                }
                _ => {}
            }
        }
        Ok((by_shard, totals))
    }

    /// Drop all slot and metadata rows, then reseed and regenerate PSKs.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM slots").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM metadata").execute(&mut *tx).await?;
        tx.commit().await?;

        self.server_passwords
            .write()
            .expect("server password cache poisoned")
            .clear();
        *self.rr_cursor.lock().expect("cursor poisoned") = 0;

        info!("Slot store reset");
        self.init().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(id: i64, port: u16, slot_count: i64) -> ShardDefinition {
        ShardDefinition {
            id,
            port,
            slot_count,
            container_name: format!("xray-ss2022-{id}"),
            api_port: 0,
        }
    }

    async fn test_store(shards: Vec<ShardDefinition>, strategy: AllocationStrategy) -> SlotStore {
        let db = Database::open_in_memory().await.unwrap();
        let store = SlotStore::new(db, shards, strategy);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn seeding_creates_configured_total() {
        let store = test_store(
            vec![shard(1, 50010, 5), shard(2, 50015, 5)],
            AllocationStrategy::Sequential,
        )
        .await;

        let (by_shard, totals) = store.slot_stats().await.unwrap();
        assert_eq!(totals, SlotCounts { free: 10, used: 0, reserved: 0 });
        assert_eq!(by_shard[&1].free, 5);
        assert_eq!(by_shard[&2].free, 5);
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = test_store(vec![shard(1, 50001, 3)], AllocationStrategy::Sequential).await;
        let slot = store.allocate(Some("u1")).await.unwrap();

        store.init().await.unwrap();

        let (_, totals) = store.slot_stats().await.unwrap();
        assert_eq!(totals, SlotCounts { free: 2, used: 1, reserved: 0 });
        // password of the allocated slot survives re-init
        let slots = store.slots_by_shard(1, 3).await.unwrap();
        assert_eq!(slots[0].password, slot.password);
    }

    #[tokio::test]
    async fn sequential_allocations_are_monotonic() {
        let store = test_store(vec![shard(1, 50001, 3)], AllocationStrategy::Sequential).await;

        let mut last = 0;
        for _ in 0..3 {
            let slot = store.allocate(None).await.unwrap();
            assert!(slot.slot_id > last);
            last = slot.slot_id;
        }
        assert!(matches!(
            store.allocate(None).await,
            Err(StoreError::NoFreePorts)
        ));
    }

    #[tokio::test]
    async fn roundrobin_alternates_shards() {
        let store = test_store(
            vec![shard(1, 50010, 5), shard(2, 50015, 5)],
            AllocationStrategy::RoundRobin,
        )
        .await;

        let mut sequence = Vec::new();
        for _ in 0..6 {
            sequence.push(store.allocate(None).await.unwrap().shard_id);
        }
        assert_eq!(sequence, vec![1, 2, 1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn roundrobin_skips_exhausted_shard() {
        let store = test_store(
            vec![shard(1, 50010, 1), shard(2, 50015, 3)],
            AllocationStrategy::RoundRobin,
        )
        .await;

        let mut sequence = Vec::new();
        for _ in 0..4 {
            sequence.push(store.allocate(None).await.unwrap().shard_id);
        }
        assert_eq!(sequence, vec![1, 2, 2, 2]);
        assert!(matches!(
            store.allocate(None).await,
            Err(StoreError::NoFreePorts)
        ));
    }

    #[tokio::test]
    async fn leastfree_prefers_largest_pool() {
        let store = test_store(
            vec![shard(1, 50010, 2), shard(2, 50015, 5)],
            AllocationStrategy::LeastFree,
        )
        .await;

        // shard 2 has more free slots, so it wins despite the higher id
        assert_eq!(store.allocate(None).await.unwrap().shard_id, 2);
    }

    #[tokio::test]
    async fn leastfree_breaks_ties_by_shard_id() {
        let store = test_store(
            vec![shard(1, 50010, 3), shard(2, 50015, 3)],
            AllocationStrategy::LeastFree,
        )
        .await;

        assert_eq!(store.allocate(None).await.unwrap().shard_id, 1);
        assert_eq!(store.allocate(None).await.unwrap().shard_id, 2);
    }

    #[tokio::test]
    async fn allocate_records_user_id() {
        let store = test_store(vec![shard(1, 50001, 2)], AllocationStrategy::Sequential).await;

        store.allocate(Some("alice")).await.unwrap();
        store.allocate(Some("")).await.unwrap();

        let slots = store.slots_by_shard(1, 2).await.unwrap();
        assert_eq!(slots[0].user_id.as_deref(), Some("alice"));
        assert_eq!(slots[1].user_id, None);
    }

    #[tokio::test]
    async fn reserve_error_taxonomy() {
        let store = test_store(vec![shard(1, 50001, 2)], AllocationStrategy::Sequential).await;
        let slot = store.allocate(None).await.unwrap();

        store.reserve(slot.slot_id).await.unwrap();
        assert!(matches!(
            store.reserve(slot.slot_id).await,
            Err(StoreError::SlotReserved)
        ));
        assert!(matches!(store.reserve(2).await, Err(StoreError::SlotFree)));
        assert!(matches!(
            store.reserve(99).await,
            Err(StoreError::SlotNotFound)
        ));
    }

    #[tokio::test]
    async fn reserve_clears_user_id() {
        let store = test_store(vec![shard(1, 50001, 1)], AllocationStrategy::Sequential).await;
        let slot = store.allocate(Some("bob")).await.unwrap();

        store.reserve(slot.slot_id).await.unwrap();

        let slots = store.slots_by_shard(1, 1).await.unwrap();
        assert_eq!(slots[0].status, "reserved");
        assert_eq!(slots[0].user_id, None);
    }

    #[tokio::test]
    async fn rotation_frees_and_changes_password() {
        let store = test_store(vec![shard(1, 50001, 2)], AllocationStrategy::Sequential).await;
        let slot = store.allocate(None).await.unwrap();
        store.reserve(slot.slot_id).await.unwrap();

        let rotated = store.rotate_reserved(1).await.unwrap();
        assert_eq!(rotated, 1);

        let slots = store.slots_by_shard(1, 2).await.unwrap();
        assert_eq!(slots[0].status, "free");
        assert_ne!(slots[0].password, slot.password);
        // untouched slot keeps its password
        assert_eq!(store.rotate_reserved(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rotation_only_targets_requested_shard() {
        let store = test_store(
            vec![shard(1, 50010, 2), shard(2, 50015, 2)],
            AllocationStrategy::Sequential,
        )
        .await;
        // slots 1 and 3 live in shards 1 and 2 respectively
        store.allocate(None).await.unwrap();
        store.reserve(1).await.unwrap();
        let slots_before = store.slots_by_shard(2, 2).await.unwrap();

        assert_eq!(store.rotate_reserved(2).await.unwrap(), 0);
        assert_eq!(store.rotate_reserved(1).await.unwrap(), 1);

        let slots_after = store.slots_by_shard(2, 2).await.unwrap();
        assert_eq!(slots_before[0].password, slots_after[0].password);
    }

    #[tokio::test]
    async fn shape_mismatch_detected() {
        let store = test_store(vec![shard(1, 50001, 3)], AllocationStrategy::Sequential).await;
        assert!(matches!(
            store.slots_by_shard(1, 4).await,
            Err(StoreError::ShapeMismatch { shard_id: 1, expected: 4, found: 3 })
        ));
    }

    #[tokio::test]
    async fn server_psk_is_stable_across_inits() {
        let store = test_store(vec![shard(1, 50001, 1)], AllocationStrategy::Sequential).await;
        let psk = store.server_password(1);
        assert!(!psk.is_empty());

        store.init().await.unwrap();
        assert_eq!(store.server_password(1), psk);
    }

    #[tokio::test]
    async fn legacy_server_psk_adopted_for_first_shard() {
        let db = Database::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO metadata (key, value, updated_at) VALUES ('server_psk', 'legacy-secret', 0)")
            .execute(db.pool())
            .await
            .unwrap();

        let store = SlotStore::new(
            db,
            vec![shard(1, 50010, 1), shard(2, 50015, 1)],
            AllocationStrategy::Sequential,
        );
        store.init().await.unwrap();

        assert_eq!(store.server_password(1), "legacy-secret");
        assert_ne!(store.server_password(2), "legacy-secret");
        // adopted under the sharded key
        let adopted = store.metadata_value("server_psk_shard_1").await.unwrap();
        assert_eq!(adopted.as_deref(), Some("legacy-secret"));
    }

    #[tokio::test]
    async fn reset_reseeds_and_rotates_everything() {
        let store = test_store(vec![shard(1, 50001, 4)], AllocationStrategy::Sequential).await;
        let psk = store.server_password(1);
        let first = store.allocate(Some("u1")).await.unwrap();
        store.allocate(Some("u2")).await.unwrap();
        store.reserve(first.slot_id).await.unwrap();

        store.reset().await.unwrap();

        let (_, totals) = store.slot_stats().await.unwrap();
        assert_eq!(totals, SlotCounts { free: 4, used: 0, reserved: 0 });
        assert_ne!(store.server_password(1), psk);
        let slots = store.slots_by_shard(1, 4).await.unwrap();
        assert!(slots.iter().all(|s| s.status == "free" && s.user_id.is_none()));
    }

    #[tokio::test]
    async fn unknown_shard_has_empty_server_password() {
        let store = test_store(vec![shard(1, 50001, 1)], AllocationStrategy::Sequential).await;
        assert_eq!(store.server_password(42), "");
    }

    #[tokio::test]
    async fn concurrent_allocations_never_share_a_slot() {
        let store = std::sync::Arc::new(
            test_store(
                vec![shard(1, 50010, 8), shard(2, 50018, 8)],
                AllocationStrategy::RoundRobin,
            )
            .await,
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.allocate(None).await.unwrap().slot_id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert!(matches!(
            store.allocate(None).await,
            Err(StoreError::NoFreePorts)
        ));
    }

    #[tokio::test]
    async fn counts_always_sum_to_slot_count() {
        let store = test_store(vec![shard(1, 50001, 5)], AllocationStrategy::Sequential).await;

        let sum = |c: SlotCounts| c.free + c.used + c.reserved;
        let (by_shard, _) = store.slot_stats().await.unwrap();
        assert_eq!(sum(by_shard[&1]), 5);

        store.allocate(Some("u1")).await.unwrap();
        store.allocate(Some("u2")).await.unwrap();
        store.reserve(1).await.unwrap();
        let (by_shard, _) = store.slot_stats().await.unwrap();
        assert_eq!(sum(by_shard[&1]), 5);

        store.rotate_reserved(1).await.unwrap();
        let (by_shard, _) = store.slot_stats().await.unwrap();
        assert_eq!(sum(by_shard[&1]), 5);
    }
}
