//! The reconciler: ties together storage, config generation, and docker
//! orchestration.
//!
//! Lock discipline: `op_lock` orders mutating operations against each other
//! while letting allocate/reserve/stats overlap on the read side. `reload_m`
//! additionally serializes the reconcile pipeline itself so two
//! reconciliations can never interleave file writes, even if a future
//! caller reaches `reload_with_lock` without holding `op_lock`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::config::{Config, ShardDefinition};
use crate::docker::DockerManager;
use crate::storage::SlotStore;
use crate::xray::build_xray_config;

/// Signal understood by the proxy as "re-read your config".
const RELOAD_SIGNAL: &str = "SIGUSR1";

/// A reconcile batch that stopped early. Shards processed before the
/// failure stay applied; their rotate counts are in `processed`.
#[derive(Debug, thiserror::Error)]
#[error("reload aborted after {} shard(s): {:#}", .processed.len(), .cause)]
pub struct ReloadError {
    pub processed: HashMap<i64, i64>,
    pub cause: anyhow::Error,
}

pub struct Agent {
    cfg: Config,
    store: SlotStore,
    docker: DockerManager,
    shard_map: HashMap<i64, ShardDefinition>,
    reload_m: Mutex<()>,
    op_lock: RwLock<()>,
}

impl Agent {
    pub fn new(cfg: Config, store: SlotStore, docker: DockerManager) -> Self {
        let shard_map = store
            .shards()
            .iter()
            .map(|sh| (sh.id, sh.clone()))
            .collect();
        Self {
            cfg,
            store,
            docker,
            shard_map,
            reload_m: Mutex::new(()),
            op_lock: RwLock::new(()),
        }
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    pub fn shards(&self) -> &[ShardDefinition] {
        self.store.shards()
    }

    pub fn shard(&self, shard_id: i64) -> Option<&ShardDefinition> {
        self.shard_map.get(&shard_id)
    }

    /// Read-side of the operation lock. Held by allocate/reserve/stats so
    /// they never overlap a reload or reset in progress.
    pub async fn op_read(&self) -> RwLockReadGuard<'_, ()> {
        self.op_lock.read().await
    }

    fn shard_list(&self, target: &[i64]) -> anyhow::Result<Vec<ShardDefinition>> {
        if target.is_empty() {
            return Ok(self.store.shards().to_vec());
        }
        target
            .iter()
            .map(|id| {
                self.shard_map
                    .get(id)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("unknown shard_id {id}"))
            })
            .collect()
    }

    /// Reconcile shards and hot-apply the result (signal, then restart).
    pub async fn reload(
        &self,
        rotate_reserved: bool,
        target: &[i64],
    ) -> Result<HashMap<i64, i64>, ReloadError> {
        let _op = self.op_lock.write().await;
        self.reload_with_lock(rotate_reserved, target, false).await
    }

    /// Reconcile shards and restart their containers unconditionally.
    pub async fn reload_and_restart(
        &self,
        rotate_reserved: bool,
        target: &[i64],
    ) -> Result<HashMap<i64, i64>, ReloadError> {
        let _op = self.op_lock.write().await;
        self.reload_with_lock(rotate_reserved, target, true).await
    }

    async fn reload_with_lock(
        &self,
        rotate_reserved: bool,
        target: &[i64],
        hard_restart: bool,
    ) -> Result<HashMap<i64, i64>, ReloadError> {
        let _reload = self.reload_m.lock().await;

        let shards = self.shard_list(target).map_err(|cause| ReloadError {
            processed: HashMap::new(),
            cause,
        })?;

        let mut results = HashMap::with_capacity(shards.len());
        for shard in &shards {
            match self.reload_shard(shard, rotate_reserved, hard_restart).await {
                Ok(count) => {
                    results.insert(shard.id, count);
                }
                Err(cause) => {
                    return Err(ReloadError {
                        processed: results,
                        cause,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Per-shard pipeline: rotate -> read -> build -> write pending ->
    /// validate -> atomic swap -> apply.
    async fn reload_shard(
        &self,
        shard: &ShardDefinition,
        rotate: bool,
        hard_restart: bool,
    ) -> anyhow::Result<i64> {
        let mut processed = 0;
        if rotate {
            processed = self
                .store
                .rotate_reserved(shard.id)
                .await
                .with_context(|| format!("rotate reserved slots of shard {}", shard.id))?;
        }

        let slots = self
            .store
            .slots_by_shard(shard.id, shard.slot_count)
            .await
            .with_context(|| format!("read slots of shard {}", shard.id))?;

        let payload = build_xray_config(&slots, shard, &self.cfg, &self.store.server_password(shard.id))
            .with_context(|| format!("build config shard {}", shard.id))?;

        let gen_path = self.cfg.shard_generated_path(shard.id);
        write_config_file(&gen_path, &payload)
            .await
            .with_context(|| format!("write config shard {}", shard.id))?;

        if let Err(e) = self.docker.test_shard(&self.cfg, shard).await {
            let _ = tokio::fs::remove_file(&gen_path).await;
            return Err(e).with_context(|| format!("config validation failed (shard {})", shard.id));
        }

        // Same-directory rename: pending and active paths share a filesystem,
        // so the active file is replaced atomically or not at all.
        if let Err(e) = tokio::fs::rename(&gen_path, self.cfg.shard_config_path(shard.id)).await {
            let _ = tokio::fs::remove_file(&gen_path).await;
            return Err(e).with_context(|| format!("activate config shard {}", shard.id));
        }

        if hard_restart {
            self.full_restart_shard(shard)
                .await
                .with_context(|| format!("restart shard {}", shard.id))?;
        } else {
            self.apply_shard(shard)
                .await
                .with_context(|| format!("apply config shard {}", shard.id))?;
        }

        info!(shard = shard.id, "shard config updated");
        Ok(processed)
    }

    /// Hot apply: signal the running container; degrade to the in-container
    /// reload endpoint, then to a full restart. A missing container is
    /// created against the freshly activated config.
    async fn apply_shard(&self, shard: &ShardDefinition) -> anyhow::Result<()> {
        let name = shard.container_name.as_str();
        if !self.docker.container_exists(name).await? {
            info!(container = name, "container not found, creating");
            return Ok(self.docker.create_container(&self.cfg, shard).await?);
        }

        match self.docker.signal_container(name, RELOAD_SIGNAL).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(container = name, error = %e, "reload signal failed");
            }
        }
        if shard.api_port > 0 {
            match self.docker.reload_via_api(shard).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(container = name, error = %e, "api reload failed, restarting container");
                }
            }
        }
        Ok(self.docker.restart_container(name).await?)
    }

    async fn full_restart_shard(&self, shard: &ShardDefinition) -> anyhow::Result<()> {
        let name = shard.container_name.as_str();
        if !self.docker.container_exists(name).await? {
            info!(container = name, "container not found, creating");
            return Ok(self.docker.create_container(&self.cfg, shard).await?);
        }
        Ok(self.docker.restart_container(name).await?)
    }

    /// Tear everything down: remove all containers (including the legacy
    /// single-shard one), wipe and reseed the store, then rebuild and
    /// restart every shard.
    pub async fn hard_reset(&self) -> anyhow::Result<()> {
        let _op = self.op_lock.write().await;

        self.cleanup_containers().await;
        self.store.reset().await.context("reset store")?;
        self.reload_with_lock(true, &[], true)
            .await
            .map_err(|e| e.cause)?;
        Ok(())
    }

    async fn cleanup_containers(&self) {
        for shard in self.store.shards() {
            if let Err(e) = self.docker.remove_if_exists(&shard.container_name).await {
                warn!(container = %shard.container_name, error = %e, "failed to remove container");
            }
        }
        if !self.cfg.container_name.is_empty() {
            if let Err(e) = self.docker.remove_if_exists(&self.cfg.container_name).await {
                warn!(container = %self.cfg.container_name, error = %e, "failed to remove legacy container");
            }
        }
    }

    /// Remove the legacy single-shard container left over from
    /// pre-sharding deployments. Best-effort, called once at startup.
    pub async fn remove_legacy_container(&self) {
        if self.cfg.container_name.is_empty() {
            return;
        }
        if let Err(e) = self.docker.remove_if_exists(&self.cfg.container_name).await {
            warn!(container = %self.cfg.container_name, error = %e, "failed to remove legacy container");
        }
    }
}

/// Write the pending config with owner read/write, group read.
async fn write_config_file(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, payload).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocationStrategy;
    use crate::storage::{Database, SlotStore};
    use tempfile::TempDir;

    /// Agent over an in-memory store. `docker_binary` stands in for the
    /// docker CLI: `true` makes every engine call succeed (and every
    /// container look present), `false` makes them exit 1.
    async fn test_agent(docker_binary: &str) -> (Agent, TempDir) {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            min_port: 50001,
            max_port: 50003,
            shard_count: 1,
            config_dir: dir.path().to_string_lossy().into_owned(),
            docker_binary: docker_binary.to_string(),
            api_port: 0,
            ..Config::default()
        };
        let shards = cfg.build_shards().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let store = SlotStore::new(db, shards, AllocationStrategy::Sequential);
        store.init().await.unwrap();
        let docker = DockerManager::new(cfg.docker_binary.clone(), cfg.docker_image.clone());
        let agent = Agent::new(cfg, store, docker);
        (agent, dir)
    }

    #[tokio::test]
    async fn reload_activates_config_and_rotates() {
        let (agent, dir) = test_agent("true").await;
        let slot = agent.store().allocate(Some("u1")).await.unwrap();
        agent.store().reserve(slot.slot_id).await.unwrap();

        let processed = agent.reload(true, &[]).await.unwrap();
        assert_eq!(processed, HashMap::from([(1, 1)]));

        let active = dir.path().join("config-shard-1.json");
        assert!(active.exists());
        assert!(!dir.path().join("config-shard-1.generated.json").exists());

        // rotated slot is free again with a fresh password
        let slots = agent.store().slots_by_shard(1, 3).await.unwrap();
        assert_eq!(slots[0].status, "free");
        assert_ne!(slots[0].password, slot.password);
    }

    #[tokio::test]
    async fn reload_is_idempotent_without_new_reservations() {
        let (agent, dir) = test_agent("true").await;

        let first = agent.reload(true, &[]).await.unwrap();
        let bytes_a = std::fs::read(dir.path().join("config-shard-1.json")).unwrap();
        let second = agent.reload(true, &[]).await.unwrap();
        let bytes_b = std::fs::read(dir.path().join("config-shard-1.json")).unwrap();

        assert_eq!(first, HashMap::from([(1, 0)]));
        assert_eq!(second, HashMap::from([(1, 0)]));
        assert_eq!(bytes_a, bytes_b);
    }

    #[tokio::test]
    async fn validation_failure_leaves_active_config_untouched() {
        let (agent, dir) = test_agent("false").await;

        let err = agent.reload(false, &[]).await.unwrap_err();
        assert!(err.processed.is_empty());

        // neither the pending nor the active file survives
        assert!(!dir.path().join("config-shard-1.generated.json").exists());
        assert!(!dir.path().join("config-shard-1.json").exists());
    }

    #[tokio::test]
    async fn unknown_target_shard_is_rejected() {
        let (agent, _dir) = test_agent("true").await;
        let err = agent.reload(false, &[42]).await.unwrap_err();
        assert!(err.processed.is_empty());
        assert!(err.cause.to_string().contains("unknown shard_id 42"));
    }

    #[tokio::test]
    async fn hard_reset_frees_all_slots_and_rotates_psk() {
        let (agent, _dir) = test_agent("true").await;
        let psk = agent.store().server_password(1);
        let slot = agent.store().allocate(Some("u1")).await.unwrap();
        agent.store().reserve(slot.slot_id).await.unwrap();
        agent.store().allocate(Some("u2")).await.unwrap();

        agent.hard_reset().await.unwrap();

        let (_, totals) = agent.store().slot_stats().await.unwrap();
        assert_eq!(totals.free, 3);
        assert_eq!(totals.used, 0);
        assert_eq!(totals.reserved, 0);
        assert_ne!(agent.store().server_password(1), psk);
    }

    #[tokio::test]
    async fn allocation_after_rotation_yields_fresh_password() {
        let (agent, _dir) = test_agent("true").await;

        let first = agent.store().allocate(None).await.unwrap();
        agent.store().reserve(first.slot_id).await.unwrap();
        agent.reload(true, &[]).await.unwrap();

        let second = agent.store().allocate(None).await.unwrap();
        assert_eq!(second.slot_id, first.slot_id);
        assert_ne!(second.password, first.password);
    }
}
