//! InConnect Agent
//!
//! Manages a fleet of SS2022 proxy containers: seeds and serves the slot
//! table, keeps per-shard configs reconciled with their containers, and
//! exposes the provisioning HTTP API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use inconnect_agent::agent::Agent;
use inconnect_agent::config::{resolve_config_path, Config};
use inconnect_agent::docker::DockerManager;
use inconnect_agent::http::{build_router, AppState};
use inconnect_agent::network::detect_outbound_ip;
use inconnect_agent::scheduler;
use inconnect_agent::storage::{Database, SlotStore};

#[derive(Parser, Debug)]
#[command(name = "inconnect-agent")]
#[command(version, about = "Control-plane agent for sharded SS2022 proxy containers")]
struct Args {
    /// Path to the YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to SQLite database file
    #[arg(long)]
    db_path: Option<String>,

    /// First managed port (inclusive)
    #[arg(long)]
    min_port: Option<u16>,

    /// Last managed port (inclusive)
    #[arg(long)]
    max_port: Option<u16>,

    /// Directory that stores Xray configs
    #[arg(long)]
    config_dir: Option<String>,

    /// Final Xray config filename
    #[arg(long)]
    config_file: Option<String>,

    /// Temporary config filename before swap
    #[arg(long)]
    generated_file: Option<String>,

    /// HTTP listen address
    #[arg(long)]
    listen: Option<String>,

    /// Public IP exposed in /adduser responses
    #[arg(long)]
    public_ip: Option<String>,

    /// Optional X-Auth-Token required for requests
    #[arg(long)]
    auth_token: Option<String>,

    /// Docker container name (legacy single-shard)
    #[arg(long)]
    container_name: Option<String>,

    /// Docker image to use for Xray runs
    #[arg(long)]
    docker_image: Option<String>,

    /// Docker binary path
    #[arg(long)]
    docker_binary: Option<String>,

    /// Shadowsocks 2022 cipher method
    #[arg(long)]
    method: Option<String>,

    /// Xray API inbound base port (0 disables)
    #[arg(long)]
    api_port: Option<u16>,

    /// Number of Xray shards (containers)
    #[arg(long)]
    shard_count: Option<u32>,

    /// Slots per shard (defaults to total slot count)
    #[arg(long)]
    shard_size: Option<u32>,

    /// Port increment between shards
    #[arg(long)]
    shard_port_step: Option<u16>,

    /// Custom shard definitions port:slots,... (overrides shard-count)
    #[arg(long)]
    shards: Option<String>,

    /// Prefix for shard container names
    #[arg(long)]
    shard_prefix: Option<String>,

    /// Automatic restart interval in seconds (0 disables)
    #[arg(long)]
    restart_interval: Option<u64>,

    /// Trigger restart for a shard once reserved slots reach this number (0 disables)
    #[arg(long)]
    restart_when_reserved: Option<i64>,

    /// Comma-separated UTC times (HH:MM) for full restarts
    #[arg(long)]
    restart_at: Option<String>,

    /// Slot allocation strategy: sequential|roundrobin|leastfree
    #[arg(long)]
    allocation_strategy: Option<String>,

    /// Reset database and shards, then exit
    #[arg(long)]
    reset: bool,

    /// Log level filter for the agent (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "INCONNECT_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "INCONNECT_LOG_JSON")]
    log_json: bool,
}

fn apply_overrides(cfg: &mut Config, args: &Args) {
    if let Some(v) = &args.db_path {
        cfg.db_path.clone_from(v);
    }
    if let Some(v) = args.min_port {
        cfg.min_port = v;
    }
    if let Some(v) = args.max_port {
        cfg.max_port = v;
    }
    if let Some(v) = &args.config_dir {
        cfg.config_dir.clone_from(v);
    }
    if let Some(v) = &args.config_file {
        cfg.config_file.clone_from(v);
    }
    if let Some(v) = &args.generated_file {
        cfg.generated_file.clone_from(v);
    }
    if let Some(v) = &args.listen {
        cfg.listen_addr.clone_from(v);
    }
    if let Some(v) = &args.public_ip {
        cfg.public_ip.clone_from(v);
    }
    if let Some(v) = &args.auth_token {
        cfg.auth_token.clone_from(v);
    }
    if let Some(v) = &args.container_name {
        cfg.container_name.clone_from(v);
    }
    if let Some(v) = &args.docker_image {
        cfg.docker_image.clone_from(v);
    }
    if let Some(v) = &args.docker_binary {
        cfg.docker_binary.clone_from(v);
    }
    if let Some(v) = &args.method {
        cfg.method.clone_from(v);
    }
    if let Some(v) = args.api_port {
        cfg.api_port = v;
    }
    if let Some(v) = args.shard_count {
        cfg.shard_count = v;
    }
    if let Some(v) = args.shard_size {
        cfg.shard_size = v;
    }
    if let Some(v) = args.shard_port_step {
        cfg.shard_port_step = v;
    }
    if let Some(v) = &args.shards {
        cfg.shard_raw.clone_from(v);
    }
    if let Some(v) = &args.shard_prefix {
        cfg.shard_prefix.clone_from(v);
    }
    if let Some(v) = args.restart_interval {
        cfg.restart_seconds = v;
    }
    if let Some(v) = args.restart_when_reserved {
        cfg.restart_reserved_per_shard = v;
    }
    if let Some(v) = &args.restart_at {
        cfg.restart_at_utc = v
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = &args.allocation_strategy {
        cfg.alloc_strategy.clone_from(v);
    }
    if args.reset {
        cfg.reset_only = true;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!(
        "inconnect_agent={0},inconnect_core={0}",
        args.log_level
    );
    inconnect_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config_path = resolve_config_path(args.config.clone());
    if let Some(path) = &config_path {
        info!(path = %path.display(), "Loading config file");
    }
    let mut cfg = Config::load(config_path.as_deref())?;
    apply_overrides(&mut cfg, &args);
    cfg.validate()?;

    let shards = cfg.build_shards()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.listen_addr,
        shards = shards.len(),
        strategy = %cfg.alloc_strategy,
        "Starting inconnect-agent"
    );

    std::fs::create_dir_all(&cfg.config_dir)
        .with_context(|| format!("ensure config dir {}", cfg.config_dir))?;

    if cfg.public_ip.is_empty() {
        match detect_outbound_ip() {
            Ok(ip) => {
                info!(ip = %ip, "Detected outbound IP");
                cfg.public_ip = ip;
            }
            Err(e) => warn!(error = %e, "Outbound IP detection failed"),
        }
    }

    let db = Database::open(Path::new(&cfg.db_path))
        .await
        .context("open database")?;
    let store = SlotStore::new(db, shards, cfg.allocation_strategy());
    store.init().await.context("initialize store")?;

    let docker = DockerManager::new(cfg.docker_binary.clone(), cfg.docker_image.clone());
    let agent = Arc::new(Agent::new(cfg.clone(), store, docker));

    if cfg.reset_only {
        info!("One-shot reset requested");
        agent.hard_reset().await.context("hard reset")?;
        info!("Reset complete");
        return Ok(());
    }

    agent.remove_legacy_container().await;

    agent
        .reload(false, &[])
        .await
        .context("initial config generation failed")?;

    // Schedulers stop when the shutdown channel flips.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();
    tasks.extend(scheduler::spawn_interval_restart(
        Arc::clone(&agent),
        cfg.restart_seconds,
        shutdown_tx.subscribe(),
    ));
    tasks.extend(scheduler::spawn_reserved_restart(
        Arc::clone(&agent),
        cfg.restart_reserved_per_shard,
        shutdown_tx.subscribe(),
    ));
    tasks.extend(scheduler::spawn_scheduled_restarts(
        Arc::clone(&agent),
        &cfg.restart_at_utc,
        shutdown_tx.subscribe(),
    ));

    let app = build_router(AppState {
        agent: Arc::clone(&agent),
    });
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "Agent HTTP API listening");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let signal_tx = shutdown_tx.clone();
    let shutdown_future = async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = sigterm_future => info!("Received SIGTERM, shutting down"),
        }
        let _ = signal_tx.send(true);
    };

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    tokio::select! {
        res = &mut server => {
            res.context("http server task")?.context("http server failed")?;
        }
        _ = shutdown_rx.changed() => {
            // shutdown began; give in-flight requests a bounded drain window
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(res) => res.context("http server task")?.context("http server failed")?,
                Err(_) => {
                    warn!("Graceful shutdown timed out, aborting server");
                    server.abort();
                }
            }
        }
    }

    // stop schedulers even when the server ended without a signal
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    info!("Agent stopped");
    Ok(())
}
