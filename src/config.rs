// src/config.rs
//
// Process-level configuration, YAML-backed like the teacher's
// `config_loader::NodeConfig`, trimmed to the fields this overlay actually
// uses and given a `Default` so tests and quick local runs need no file.

use crate::error::CoordError;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{info, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub bootstrap_addr: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_genesis_balance")]
    pub genesis_balance: u64,
    #[serde(default = "default_seen_capacity")]
    pub broadcast_seen_capacity: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_k() -> usize {
    20
}
fn default_alpha() -> usize {
    3
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_genesis_balance() -> u64 {
    100
}
fn default_seen_capacity() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            bootstrap_addr: None,
            k: default_k(),
            alpha: default_alpha(),
            request_timeout_ms: default_timeout_ms(),
            genesis_balance: default_genesis_balance(),
            broadcast_seen_capacity: default_seen_capacity(),
            log_level: default_log_level(),
        }
    }
}

#[instrument(name = "load_config", skip(path))]
pub fn load_config(path: &str) -> anyhow::Result<NodeConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| CoordError::ConfigError(format!("reading {path}: {e}")))?;
    let cfg: NodeConfig = serde_yaml::from_str(&content)
        .map_err(|e| CoordError::ConfigError(format!("parsing {path}: {e}")))?;
    info!(
        "NodeConfig loaded: listen_addr={}, bootstrap_addr={:?}, k={}, alpha={}",
        cfg.listen_addr, cfg.bootstrap_addr, cfg.k, cfg.alpha
    );
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = NodeConfig {
            listen_addr: "127.0.0.1:9001".to_string(),
            bootstrap_addr: Some("127.0.0.1:9000".to_string()),
            ..NodeConfig::default()
        };
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: NodeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.listen_addr, cfg.listen_addr);
        assert_eq!(back.bootstrap_addr, cfg.bootstrap_addr);
        assert_eq!(back.k, cfg.k);
    }

    #[test]
    fn defaults_fill_in_missing_fields() {
        let yaml = "listen_addr: \"127.0.0.1:9001\"\n";
        let cfg: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.k, 20);
        assert_eq!(cfg.alpha, 3);
        assert_eq!(cfg.genesis_balance, 100);
    }
}
