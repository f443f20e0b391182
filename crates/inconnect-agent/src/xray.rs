//! Xray config generation.
//!
//! `build_xray_config` is a pure function from the slot set and shard
//! topology to the proxy's JSON document. Every slot appears in the client
//! list regardless of status, so allocations never require regenerating
//! the file; credentials only move on rotation.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{Config, ShardDefinition};
use crate::storage::Slot;

#[derive(Serialize)]
struct XrayConfig {
    api: ApiConfig,
    routing: RoutingConfig,
    policy: PolicyConfig,
    inbounds: Vec<Inbound>,
    outbounds: Vec<Outbound>,
    stats: StatsConfig,
}

#[derive(Serialize)]
struct ApiConfig {
    tag: String,
    services: Vec<String>,
}

#[derive(Serialize)]
struct RoutingConfig {
    rules: Vec<RoutingRule>,
}

#[derive(Serialize)]
struct RoutingRule {
    #[serde(rename = "inboundTag")]
    inbound_tag: Vec<String>,
    #[serde(rename = "outboundTag")]
    outbound_tag: String,
    #[serde(rename = "type")]
    rule_type: String,
}

#[derive(Serialize)]
struct PolicyConfig {
    levels: BTreeMap<String, PolicyLevel>,
    system: PolicySystem,
}

#[derive(Serialize)]
struct PolicyLevel {
    #[serde(rename = "statsUserUplink")]
    stats_user_uplink: bool,
    #[serde(rename = "statsUserDownlink")]
    stats_user_downlink: bool,
}

#[derive(Serialize)]
struct PolicySystem {
    #[serde(rename = "statsInboundUplink")]
    stats_inbound_uplink: bool,
    #[serde(rename = "statsInboundDownlink")]
    stats_inbound_downlink: bool,
    #[serde(rename = "statsOutboundUplink")]
    stats_outbound_uplink: bool,
    #[serde(rename = "statsOutboundDownlink")]
    stats_outbound_downlink: bool,
}

#[derive(Serialize)]
struct Inbound {
    #[serde(skip_serializing_if = "String::is_empty")]
    listen: String,
    port: u16,
    protocol: String,
    settings: InboundSettings,
    #[serde(skip_serializing_if = "String::is_empty")]
    tag: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum InboundSettings {
    Shadowsocks {
        method: String,
        password: String,
        network: String,
        clients: Vec<SsClient>,
    },
    DokodemoDoor {
        address: String,
    },
}

#[derive(Serialize)]
struct Outbound {
    protocol: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    tag: String,
}

#[derive(Serialize)]
struct StatsConfig {}

#[derive(Serialize)]
struct SsClient {
    password: String,
    email: String,
}

/// Render the full proxy config for one shard as pretty-printed JSON.
pub fn build_xray_config(
    slots: &[Slot],
    shard: &ShardDefinition,
    cfg: &Config,
    server_password: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let clients = slots
        .iter()
        .map(|slot| SsClient {
            password: slot.password.clone(),
            email: match slot.user_id.as_deref() {
                Some(user) if !user.is_empty() => user.to_string(),
                _ => format!("slot-{}", slot.slot_id),
            },
        })
        .collect();

    let mut inbounds = vec![Inbound {
        listen: "0.0.0.0".to_string(),
        port: shard.port,
        protocol: "shadowsocks".to_string(),
        settings: InboundSettings::Shadowsocks {
            method: cfg.method.clone(),
            password: server_password.to_string(),
            network: "tcp,udp".to_string(),
            clients,
        },
        tag: String::new(),
    }];

    if shard.api_port > 0 {
        inbounds.push(Inbound {
            listen: "0.0.0.0".to_string(),
            port: shard.api_port,
            protocol: "dokodemo-door".to_string(),
            settings: InboundSettings::DokodemoDoor {
                address: "0.0.0.0".to_string(),
            },
            tag: "api".to_string(),
        });
    }

    let payload = XrayConfig {
        api: ApiConfig {
            tag: "api".to_string(),
            services: vec![
                "HandlerService".to_string(),
                "LoggerService".to_string(),
                "StatsService".to_string(),
            ],
        },
        routing: RoutingConfig {
            rules: vec![RoutingRule {
                inbound_tag: vec!["api".to_string()],
                outbound_tag: "api".to_string(),
                rule_type: "field".to_string(),
            }],
        },
        policy: PolicyConfig {
            levels: BTreeMap::from([(
                "1".to_string(),
                PolicyLevel {
                    stats_user_uplink: true,
                    stats_user_downlink: true,
                },
            )]),
            system: PolicySystem {
                stats_inbound_uplink: true,
                stats_inbound_downlink: true,
                stats_outbound_uplink: true,
                stats_outbound_downlink: true,
            },
        },
        inbounds,
        outbounds: vec![
            Outbound {
                protocol: "freedom".to_string(),
                tag: String::new(),
            },
            Outbound {
                protocol: "dns".to_string(),
                tag: "api".to_string(),
            },
        ],
        stats: StatsConfig {},
    };

    serde_json::to_vec_pretty(&payload)
}
