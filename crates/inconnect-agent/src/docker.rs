//! Thin wrapper over the container-engine CLI.
//!
//! Every call shells out to the configured binary and waits for it to
//! finish. Failures carry the exit code and combined output so callers can
//! tell "container does not exist" (`inspect` exiting 1) from real errors.

use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use crate::config::{Config, ShardDefinition};

/// Mount point of the config directory inside proxy containers.
const CONTAINER_CONFIG_DIR: &str = "/etc/xray";

/// A container-engine invocation that exited non-zero.
#[derive(Debug, thiserror::Error)]
#[error("{program} {args:?} failed (exit {exit_code}): {output}")]
pub struct CommandError {
    pub program: String,
    pub args: Vec<String>,
    pub output: String,
    pub exit_code: i32,
}

/// Container driver errors.
#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("api reload failed: {0}")]
    ApiReload(String),
}

/// Docker CLI orchestration for shard containers.
pub struct DockerManager {
    binary: String,
    image: String,
}

impl DockerManager {
    pub fn new(binary: String, image: String) -> Self {
        Self { binary, image }
    }

    async fn run(&self, args: &[&str]) -> Result<(), DockerError> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DockerError::Spawn {
                program: self.binary.clone(),
                source: e,
            })?;
        if output.status.success() {
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(CommandError {
            program: self.binary.clone(),
            args: args.iter().map(ToString::to_string).collect(),
            output: combined,
            exit_code: output.status.code().unwrap_or(-1),
        }
        .into())
    }

    /// Whether a container with this name exists. `inspect` exiting 1 means
    /// "no such container"; any other failure propagates.
    pub async fn container_exists(&self, name: &str) -> Result<bool, DockerError> {
        match self.run(&["inspect", name]).await {
            Ok(()) => Ok(true),
            Err(DockerError::Command(e)) if e.exit_code == 1 => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Validate a shard's pending config with an ephemeral proxy container.
    pub async fn test_shard(&self, cfg: &Config, shard: &ShardDefinition) -> Result<(), DockerError> {
        let volume = format!("{}:{CONTAINER_CONFIG_DIR}", cfg.config_dir);
        let config_arg = container_config_arg(cfg.shard_generated_path(shard.id));
        self.run(&[
            "run",
            "--rm",
            "-v",
            volume.as_str(),
            self.image.as_str(),
            "xray",
            "-test",
            "-config",
            config_arg.as_str(),
        ])
        .await
    }

    pub async fn restart_container(&self, name: &str) -> Result<(), DockerError> {
        self.run(&["restart", name]).await
    }

    /// Deliver a signal to a running container (e.g. `SIGUSR1` for a hot
    /// config reload).
    pub async fn signal_container(&self, name: &str, signal: &str) -> Result<(), DockerError> {
        let signal_arg = format!("--signal={signal}");
        self.run(&["kill", signal_arg.as_str(), name]).await
    }

    pub async fn create_container(
        &self,
        cfg: &Config,
        shard: &ShardDefinition,
    ) -> Result<(), DockerError> {
        let volume = format!("{}:{CONTAINER_CONFIG_DIR}", cfg.config_dir);
        let tcp = format!("{0}:{0}/tcp", shard.port);
        let udp = format!("{0}:{0}/udp", shard.port);
        let config_arg = container_config_arg(cfg.shard_config_path(shard.id));

        let mut args = vec![
            "run",
            "-d",
            "--name",
            shard.container_name.as_str(),
            "--restart=always",
            "-v",
            volume.as_str(),
            "-p",
            tcp.as_str(),
            "-p",
            udp.as_str(),
        ];
        let api = format!("{0}:{0}/tcp", shard.api_port);
        if shard.api_port > 0 {
            args.push("-p");
            args.push(api.as_str());
        }
        args.extend([self.image.as_str(), "xray", "-config", config_arg.as_str()]);
        self.run(&args).await
    }

    /// Remove a container if present; missing containers are not an error.
    pub async fn remove_if_exists(&self, name: &str) -> Result<(), DockerError> {
        if !self.container_exists(name).await? {
            return Ok(());
        }
        info!(container = name, "Removing container");
        self.run(&["rm", "-f", name]).await
    }

    /// Ask the in-container reload endpoint to re-read its config.
    pub async fn reload_via_api(&self, shard: &ShardDefinition) -> Result<(), DockerError> {
        if shard.api_port == 0 {
            return Err(DockerError::ApiReload("api port is not configured".into()));
        }
        let url = format!("http://127.0.0.1:{}/config/reload", shard.api_port);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DockerError::ApiReload(e.to_string()))?;
        let resp = client
            .post(&url)
            .send()
            .await
            .map_err(|e| DockerError::ApiReload(e.to_string()))?;
        if resp.status().as_u16() >= 300 {
            let status = resp.status();
            let body: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(4096)
                .collect();
            return Err(DockerError::ApiReload(format!("status {status}: {body}")));
        }
        Ok(())
    }
}

/// Path of a host-side config file as seen from inside the container.
fn container_config_arg(host_path: std::path::PathBuf) -> String {
    let name = host_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{CONTAINER_CONFIG_DIR}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inspect_exit_one_means_absent() {
        // `false` exits 1, standing in for `docker inspect` on a missing name
        let docker = DockerManager::new("false".to_string(), "img".to_string());
        assert!(!docker.container_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn inspect_success_means_present() {
        let docker = DockerManager::new("true".to_string(), "img".to_string());
        assert!(docker.container_exists("present").await.unwrap());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let docker = DockerManager::new("/nonexistent/docker".to_string(), "img".to_string());
        assert!(matches!(
            docker.container_exists("x").await,
            Err(DockerError::Spawn { .. })
        ));
    }

    #[test]
    fn command_error_reports_argv_and_exit_code() {
        let err = CommandError {
            program: "docker".to_string(),
            args: vec!["restart".to_string(), "xray-ss2022-1".to_string()],
            output: "no such container".to_string(),
            exit_code: 125,
        };
        let msg = err.to_string();
        assert!(msg.contains("restart"));
        assert!(msg.contains("125"));
        assert!(msg.contains("no such container"));
    }

    #[test]
    fn container_paths_use_basename_only() {
        let arg = container_config_arg("/etc/xray/config-shard-2.generated.json".into());
        assert_eq!(arg, "/etc/xray/config-shard-2.generated.json");
        let arg = container_config_arg("/somewhere/else/config-shard-2.json".into());
        assert_eq!(arg, "/etc/xray/config-shard-2.json");
    }
}
