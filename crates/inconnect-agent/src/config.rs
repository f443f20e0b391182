//! Runtime configuration for the agent.
//!
//! Resolution order (lowest to highest):
//! 1. Built-in defaults
//! 2. YAML config file (`-config` flag, `INCONNECT_CONFIG` env,
//!    `/etc/inconnect-agent/config.yaml`, `./config.yaml`)
//! 3. CLI arguments

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/inconnect-agent/config.yaml";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Complete runtime configuration for the agent.
///
/// Field names mirror the YAML keys accepted in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "dbPath")]
    pub db_path: String,
    #[serde(rename = "minPort")]
    pub min_port: u16,
    #[serde(rename = "maxPort")]
    pub max_port: u16,
    #[serde(rename = "configDir")]
    pub config_dir: String,
    #[serde(rename = "configFile")]
    pub config_file: String,
    #[serde(rename = "generatedFile")]
    pub generated_file: String,
    #[serde(rename = "listen")]
    pub listen_addr: String,
    #[serde(rename = "publicIP")]
    pub public_ip: String,
    #[serde(rename = "authToken")]
    pub auth_token: String,
    /// Legacy single-shard container name, removed on startup when present.
    #[serde(rename = "containerName")]
    pub container_name: String,
    #[serde(rename = "dockerImage")]
    pub docker_image: String,
    #[serde(rename = "dockerBinary")]
    pub docker_binary: String,
    #[serde(rename = "method")]
    pub method: String,
    /// Base port for per-shard api inbounds; 0 disables them.
    #[serde(rename = "apiPort")]
    pub api_port: u16,
    #[serde(rename = "shardCount")]
    pub shard_count: u32,
    #[serde(rename = "shardSize")]
    pub shard_size: u32,
    #[serde(rename = "shardPortStep")]
    pub shard_port_step: u16,
    /// Custom shard definitions `port:slots,...` (overrides shardCount).
    #[serde(rename = "shards")]
    pub shard_raw: String,
    #[serde(rename = "shardPrefix")]
    pub shard_prefix: String,
    /// Automatic restart interval in seconds; 0 disables.
    #[serde(rename = "restartInterval")]
    pub restart_seconds: u64,
    /// Restart a shard once its reserved slots reach this count; 0 disables.
    #[serde(rename = "restartWhenReserved")]
    pub restart_reserved_per_shard: i64,
    /// UTC times of day (`HH:MM`) for full restarts.
    #[serde(rename = "restartAt")]
    pub restart_at_utc: Vec<String>,
    #[serde(rename = "allocationStrategy")]
    pub alloc_strategy: String,
    /// Reset database and shards, then exit.
    #[serde(rename = "reset")]
    pub reset_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/inconnect-agent/ports.db".to_string(),
            min_port: 50001,
            max_port: 50250,
            config_dir: "/etc/xray".to_string(),
            config_file: "config.json".to_string(),
            generated_file: "config.generated.json".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
            public_ip: String::new(),
            auth_token: String::new(),
            container_name: "xray-ss2022".to_string(),
            docker_image: "teddysun/xray:latest".to_string(),
            docker_binary: "docker".to_string(),
            method: "2022-blake3-aes-128-gcm".to_string(),
            api_port: 10085,
            shard_count: 1,
            shard_size: 0,
            shard_port_step: 1,
            shard_raw: String::new(),
            shard_prefix: "xray-ss2022".to_string(),
            restart_seconds: 0,
            restart_reserved_per_shard: 0,
            restart_at_utc: Vec::new(),
            alloc_strategy: "roundrobin".to_string(),
            reset_only: false,
        }
    }
}

impl Config {
    /// Load defaults overlaid with the YAML file at `path`, when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        AllocationStrategy::from_str(&self.alloc_strategy)
            .map_err(|()| ConfigError::Invalid(format!("invalid allocation strategy {:?}", self.alloc_strategy)))?;
        if self.min_port == 0 || self.max_port == 0 {
            return Err(ConfigError::Invalid("ports must be positive".into()));
        }
        if self.min_port > self.max_port {
            return Err(ConfigError::Invalid(format!(
                "min port ({}) is greater than max port ({})",
                self.min_port, self.max_port
            )));
        }
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("listen address is required".into()));
        }
        if self.config_dir.is_empty() {
            return Err(ConfigError::Invalid("config directory is required".into()));
        }
        if Path::new(&self.config_file).extension().is_none() {
            return Err(ConfigError::Invalid(
                "config file name must include extension".into(),
            ));
        }
        if Path::new(&self.generated_file).extension().is_none() {
            return Err(ConfigError::Invalid(
                "generated file name must include extension".into(),
            ));
        }
        for t in &self.restart_at_utc {
            if parse_restart_time(t).is_none() {
                return Err(ConfigError::Invalid(format!("invalid restart time {t:?}")));
            }
        }
        Ok(())
    }

    pub fn allocation_strategy(&self) -> AllocationStrategy {
        AllocationStrategy::from_str(&self.alloc_strategy).unwrap_or_default()
    }

    pub fn port_count(&self) -> i64 {
        i64::from(self.max_port) - i64::from(self.min_port) + 1
    }

    /// Active config path for a shard. Lives in `config_dir`, so the rename
    /// from the generated path stays on one filesystem.
    pub fn shard_config_path(&self, shard_id: i64) -> PathBuf {
        Path::new(&self.config_dir).join(format!("config-shard-{shard_id}.json"))
    }

    /// Pending (generated, not yet validated) config path for a shard.
    pub fn shard_generated_path(&self, shard_id: i64) -> PathBuf {
        Path::new(&self.config_dir).join(format!("config-shard-{shard_id}.generated.json"))
    }

    fn shard_container(&self, shard_id: i64) -> String {
        format!("{}-{shard_id}", self.shard_prefix)
    }

    fn shard_api_port_for(&self, shard_id: i64) -> Result<u16, ConfigError> {
        if self.api_port == 0 {
            return Ok(0);
        }
        u32::from(self.api_port)
            .checked_add(u32::try_from(shard_id - 1).unwrap_or(u32::MAX))
            .filter(|p| *p <= u32::from(u16::MAX))
            .map(|p| p as u16)
            .ok_or_else(|| ConfigError::Invalid(format!("api port overflow for shard {shard_id}")))
    }

    fn default_shard_size(&self) -> i64 {
        if self.shard_size > 0 {
            i64::from(self.shard_size)
        } else {
            self.port_count()
        }
    }

    fn default_shard_count(&self) -> u32 {
        if self.shard_count > 0 {
            self.shard_count
        } else {
            1
        }
    }

    fn shards_from_raw(&self) -> Result<Option<Vec<ShardDefinition>>, ConfigError> {
        if self.shard_raw.trim().is_empty() {
            return Ok(None);
        }
        let mut defs = Vec::new();
        for part in self.shard_raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (port, slots) = part.split_once(':').ok_or_else(|| {
                ConfigError::Invalid(format!("invalid shard format {part:?}, expected port:slots"))
            })?;
            let port: u16 = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid shard port {port:?}")))?;
            let slots: i64 = slots
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("invalid shard slot count {slots:?}")))?;
            if slots <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "shard slots must be positive for {part:?}"
                )));
            }
            let id = defs.len() as i64 + 1;
            defs.push(ShardDefinition {
                id,
                port,
                slot_count: slots,
                container_name: self.shard_container(id),
                api_port: self.shard_api_port_for(id)?,
            });
        }
        if defs.is_empty() {
            return Err(ConfigError::Invalid(
                "no valid shard definitions provided".into(),
            ));
        }
        Ok(Some(defs))
    }

    /// Derive the shard topology from configuration.
    pub fn build_shards(&self) -> Result<Vec<ShardDefinition>, ConfigError> {
        if let Some(defs) = self.shards_from_raw()? {
            return Ok(defs);
        }
        let size = self.default_shard_size();
        let count = self.default_shard_count();
        if size <= 0 {
            return Err(ConfigError::Invalid(
                "invalid shard size/count configuration".into(),
            ));
        }
        let mut defs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let id = i64::from(i) + 1;
            let port = u32::from(self.min_port)
                .checked_add(i * u32::from(self.shard_port_step))
                .filter(|p| *p <= u32::from(u16::MAX))
                .ok_or_else(|| ConfigError::Invalid(format!("shard port overflow for shard {id}")))?;
            defs.push(ShardDefinition {
                id,
                port: port as u16,
                slot_count: size,
                container_name: self.shard_container(id),
                api_port: self.shard_api_port_for(id)?,
            });
        }
        Ok(defs)
    }
}

/// One proxy container: a contiguous range of slots behind one listen port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDefinition {
    pub id: i64,
    pub port: u16,
    pub slot_count: i64,
    pub container_name: String,
    /// 0 means no api inbound.
    pub api_port: u16,
}

/// Slot allocation policy. Only the row-selection predicate differs
/// between policies; the transactional envelope is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// Minimum free slot id, globally.
    Sequential,
    /// Rotate across shards, advancing a shard cursor per allocation.
    #[default]
    RoundRobin,
    /// Shard with the most free slots, ties broken by shard id.
    LeastFree,
}

impl AllocationStrategy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::RoundRobin => "roundrobin",
            Self::LeastFree => "leastfree",
        }
    }
}

impl FromStr for AllocationStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "roundrobin" => Ok(Self::RoundRobin),
            "leastfree" => Ok(Self::LeastFree),
            _ => Err(()),
        }
    }
}

/// Parse a `HH:MM` UTC time of day into seconds since midnight.
pub fn parse_restart_time(value: &str) -> Option<u32> {
    let (h, m) = value.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h >= 24 || m >= 60 {
        return None;
    }
    Some(h * 3600 + m * 60)
}

/// Resolve the config file path: explicit flag, then `INCONNECT_CONFIG`,
/// then the system default, then `./config.yaml` when one exists.
pub fn resolve_config_path(flag_value: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = flag_value {
        return Some(path);
    }
    if let Ok(env) = std::env::var("INCONNECT_CONFIG") {
        let env = env.trim();
        if !env.is_empty() {
            return Some(PathBuf::from(env));
        }
    }
    let system = Path::new(DEFAULT_CONFIG_FILE);
    if system.exists() {
        return Some(system.to_path_buf());
    }
    let local = Path::new("config.yaml");
    if local.exists() {
        return Some(local.to_path_buf());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.alloc_strategy, "roundrobin");
        assert_eq!(cfg.port_count(), 250);
    }

    #[test]
    fn derived_shards_step_ports() {
        let cfg = Config {
            min_port: 50010,
            max_port: 50019,
            shard_count: 2,
            shard_size: 5,
            shard_port_step: 5,
            ..Config::default()
        };
        let shards = cfg.build_shards().unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].port, 50010);
        assert_eq!(shards[1].port, 50015);
        assert_eq!(shards[0].slot_count, 5);
        assert_eq!(shards[1].container_name, "xray-ss2022-2");
        assert_eq!(shards[0].api_port, 10085);
        assert_eq!(shards[1].api_port, 10086);
    }

    #[test]
    fn shard_size_defaults_to_port_span() {
        let cfg = Config {
            min_port: 50001,
            max_port: 50003,
            shard_count: 1,
            ..Config::default()
        };
        let shards = cfg.build_shards().unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].slot_count, 3);
    }

    #[test]
    fn explicit_shard_list_overrides_count() {
        let cfg = Config {
            shard_raw: "50001:10, 50100:20".to_string(),
            shard_count: 7,
            ..Config::default()
        };
        let shards = cfg.build_shards().unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].id, 1);
        assert_eq!(shards[0].port, 50001);
        assert_eq!(shards[0].slot_count, 10);
        assert_eq!(shards[1].id, 2);
        assert_eq!(shards[1].port, 50100);
        assert_eq!(shards[1].slot_count, 20);
    }

    #[test]
    fn malformed_shard_list_rejected() {
        let cfg = Config {
            shard_raw: "50001".to_string(),
            ..Config::default()
        };
        assert!(cfg.build_shards().is_err());

        let cfg = Config {
            shard_raw: "50001:0".to_string(),
            ..Config::default()
        };
        assert!(cfg.build_shards().is_err());
    }

    #[test]
    fn api_port_zero_disables_api_inbound() {
        let cfg = Config {
            api_port: 0,
            ..Config::default()
        };
        let shards = cfg.build_shards().unwrap();
        assert_eq!(shards[0].api_port, 0);
    }

    #[test]
    fn validation_rejects_inverted_port_range() {
        let cfg = Config {
            min_port: 50010,
            max_port: 50001,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_missing_extension() {
        let cfg = Config {
            config_file: "config".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_restart_time() {
        let cfg = Config {
            restart_at_utc: vec!["25:00".to_string()],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_strategy() {
        let cfg = Config {
            alloc_strategy: "random".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn restart_time_parsing() {
        assert_eq!(parse_restart_time("00:00"), Some(0));
        assert_eq!(parse_restart_time("23:59"), Some(23 * 3600 + 59 * 60));
        assert_eq!(parse_restart_time("3:04"), None);
        assert_eq!(parse_restart_time("12:60"), None);
        assert_eq!(parse_restart_time("noon"), None);
    }

    #[test]
    fn yaml_overlay_keeps_defaults() {
        let cfg: Config = serde_yaml::from_str("minPort: 50010\nauthToken: secret\n").unwrap();
        assert_eq!(cfg.min_port, 50010);
        assert_eq!(cfg.auth_token, "secret");
        // untouched keys fall back to defaults
        assert_eq!(cfg.max_port, 50250);
        assert_eq!(cfg.method, "2022-blake3-aes-128-gcm");
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "shardCount: 2\nshardSize: 5\nshardPortStep: 5\nrestartAt:\n  - \"00:00\"\n  - \"12:30\"\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.shard_count, 2);
        assert_eq!(cfg.shard_size, 5);
        assert_eq!(cfg.restart_at_utc, vec!["00:00", "12:30"]);
    }

    #[test]
    fn load_without_file_gives_defaults() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.db_path, "/var/lib/inconnect-agent/ports.db");
        assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/config.yaml"))).is_err());
    }
}
