//! Background restart triggers.
//!
//! Three independent, optional schedulers. Each runs as a tokio task bound
//! to the daemon shutdown channel and funnels through
//! [`Agent::reload_and_restart`], inheriting the operation lock; a failed
//! cycle is logged and the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use inconnect_core::db::unix_timestamp;

use crate::agent::Agent;
use crate::config::parse_restart_time;

const RESERVED_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const SECONDS_PER_DAY: u64 = 86_400;

/// Full reload+restart of every shard on a fixed interval.
pub fn spawn_interval_restart(
    agent: Arc<Agent>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // the first tick completes immediately; consume it so the initial
        // restart happens one full interval after startup
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = agent.reload_and_restart(true, &[]).await {
                        error!(error = %e, "auto restart failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("interval restart scheduler stopped");
                    return;
                }
            }
        }
    }))
}

/// Restart individual shards once their reserved slot count reaches the
/// threshold, checked once a minute.
pub fn spawn_reserved_restart(
    agent: Arc<Agent>,
    threshold: i64,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if threshold <= 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RESERVED_CHECK_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    check_and_restart_on_reserved(&agent, threshold).await;
                }
                _ = shutdown.changed() => {
                    info!("reserved threshold scheduler stopped");
                    return;
                }
            }
        }
    }))
}

async fn check_and_restart_on_reserved(agent: &Agent, threshold: i64) {
    let stats = {
        let _op = agent.op_read().await;
        agent.store().slot_stats().await
    };
    let (by_shard, _) = match stats {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, "reserved threshold check failed");
            return;
        }
    };

    let targets: Vec<i64> = agent
        .shards()
        .iter()
        .map(|sh| sh.id)
        .filter(|id| by_shard.get(id).map_or(0, |c| c.reserved) >= threshold)
        .collect();

    for shard_id in targets {
        info!(shard = shard_id, threshold, "reserved slots reached threshold, restarting");
        if let Err(e) = agent.reload_and_restart(true, &[shard_id]).await {
            error!(shard = shard_id, error = %e, "reserved threshold restart failed");
        }
    }
}

/// Full reload+restart of every shard at fixed UTC times of day.
pub fn spawn_scheduled_restarts(
    agent: Arc<Agent>,
    times: &[String],
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let mut schedule: Vec<u64> = times
        .iter()
        .filter_map(|t| {
            let parsed = parse_restart_time(t);
            if parsed.is_none() {
                warn!(time = %t, "skipping invalid restart time");
            }
            parsed.map(u64::from)
        })
        .collect();
    schedule.sort_unstable();
    schedule.dedup();
    if schedule.is_empty() {
        return None;
    }

    Some(tokio::spawn(async move {
        loop {
            let wait = next_restart_delay(utc_seconds_of_day(), &schedule);
            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    info!("scheduled restart trigger (UTC)");
                    if let Err(e) = agent.reload_and_restart(true, &[]).await {
                        error!(error = %e, "scheduled restart failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduled restart scheduler stopped");
                    return;
                }
            }
        }
    }))
}

fn utc_seconds_of_day() -> u64 {
    unix_timestamp().unsigned_abs() % SECONDS_PER_DAY
}

/// Time until the next scheduled occurrence: the earliest entry still ahead
/// today, else the first entry tomorrow. `schedule` is sorted seconds of day.
fn next_restart_delay(now: u64, schedule: &[u64]) -> Duration {
    for &sched in schedule {
        if sched > now {
            return Duration::from_secs(sched - now);
        }
    }
    Duration::from_secs(SECONDS_PER_DAY - now + schedule[0])
}
