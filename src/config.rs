//! Configuration surface: a simple `key = value` file loader layered with
//! CLI overrides.
//!
//! File format and override precedence follow the original C daemon's
//! config loader, with the CLI layer expressed via `clap::Parser`.

use crate::error::{RaleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogDestination {
    Stderr,
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_id: i32,
    pub node_name: String,
    pub node_ip: String,
    pub node_priority: i32,
    pub rale_port: u16,
    pub dstore_port: u16,

    pub db_path: String,
    pub control_socket_path: String,

    pub log_destination: LogDestination,
    pub log_file: Option<String>,
    pub log_level: String,

    pub dstore_keep_alive_interval: u64,
    pub dstore_keep_alive_timeout: u64,

    pub communication_max_retries: u32,

    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: i32,
    pub name: String,
    pub ip: String,
    pub rale_port: u16,
    pub dstore_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            node_name: "node1".to_string(),
            node_ip: "127.0.0.1".to_string(),
            node_priority: 0,
            rale_port: 5001,
            dstore_port: 6001,
            db_path: ".".to_string(),
            control_socket_path: "/tmp/raled.sock".to_string(),
            log_destination: LogDestination::Stderr,
            log_file: None,
            log_level: "info".to_string(),
            dstore_keep_alive_interval: 5,
            dstore_keep_alive_timeout: 5,
            communication_max_retries: 10,
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a `key = value` config file, `#`-prefixed comments and blank
    /// lines ignored. Unknown keys are tolerated (forward-compatibility
    /// with `raled_log_*` / `communication_*` keys that only affect the
    /// ambient logging stack).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| RaleError::Configuration(e.to_string()))?;
        let mut map: HashMap<String, String> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        let mut cfg = Config::default();
        macro_rules! set_parsed {
            ($key:literal, $field:expr) => {
                if let Some(v) = map.get($key) {
                    $field = v.parse().map_err(|_| {
                        RaleError::Configuration(format!("invalid value for {}", $key))
                    })?;
                }
            };
        }
        set_parsed!("node_id", cfg.node_id);
        if let Some(v) = map.get("node_name") {
            cfg.node_name = v.clone();
        }
        if let Some(v) = map.get("node_ip") {
            cfg.node_ip = v.clone();
        }
        set_parsed!("node_priority", cfg.node_priority);
        set_parsed!("rale_port", cfg.rale_port);
        set_parsed!("dstore_port", cfg.dstore_port);
        if let Some(v) = map.get("db.path") {
            cfg.db_path = v.clone();
        }
        if let Some(v) = map.get("control_socket_path") {
            cfg.control_socket_path = v.clone();
        }
        if let Some(v) = map.get("raled_log_destination") {
            cfg.log_destination = match v.as_str() {
                "stdout" => LogDestination::Stdout,
                "file" => LogDestination::File,
                _ => LogDestination::Stderr,
            };
        }
        if let Some(v) = map.get("raled_log_file") {
            cfg.log_file = Some(v.clone());
        }
        if let Some(v) = map.get("raled_log_level") {
            cfg.log_level = v.clone();
        }
        set_parsed!("dstore_keep_alive_interval", cfg.dstore_keep_alive_interval);
        set_parsed!("dstore_keep_alive_timeout", cfg.dstore_keep_alive_timeout);
        set_parsed!("communication_max_retries", cfg.communication_max_retries);

        cfg.peers = parse_peers(&map)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id <= 0 {
            return Err(RaleError::Configuration("node_id must be > 0".into()));
        }
        if self.node_name.is_empty() {
            return Err(RaleError::Configuration("node_name must not be empty".into()));
        }
        if self.rale_port == 0 || self.dstore_port == 0 {
            return Err(RaleError::Configuration(
                "rale_port and dstore_port must be in [1, 65535]".into(),
            ));
        }
        Ok(())
    }
}

/// Collect `peer.<id>.{name,ip,rale_port,dstore_port}` keys into
/// `PeerConfig` entries, the same field-per-line convention the
/// membership registry uses for `cluster.state` (§4.1), so a static peer
/// list can be seeded from the config file instead of requiring a prior
/// `cluster.state` or a run of `ADD` commands.
fn parse_peers(map: &HashMap<String, String>) -> Result<Vec<PeerConfig>> {
    let mut ids: Vec<i32> = Vec::new();
    for key in map.keys() {
        if let Some(rest) = key.strip_prefix("peer.") {
            if let Some((id_str, _field)) = rest.split_once('.') {
                if let Ok(id) = id_str.parse::<i32>() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
    }
    ids.sort_unstable();

    let mut peers = Vec::with_capacity(ids.len());
    for id in ids {
        let get = |field: &str| map.get(&format!("peer.{id}.{field}"));
        let name = get("name").cloned().unwrap_or_else(|| format!("node{id}"));
        let ip = get("ip")
            .cloned()
            .ok_or_else(|| RaleError::Configuration(format!("peer.{id}.ip is required")))?;
        let rale_port = get("rale_port")
            .ok_or_else(|| RaleError::Configuration(format!("peer.{id}.rale_port is required")))?
            .parse()
            .map_err(|_| RaleError::Configuration(format!("invalid peer.{id}.rale_port")))?;
        let dstore_port = get("dstore_port")
            .ok_or_else(|| RaleError::Configuration(format!("peer.{id}.dstore_port is required")))?
            .parse()
            .map_err(|_| RaleError::Configuration(format!("invalid peer.{id}.dstore_port")))?;
        peers.push(PeerConfig { id, name, ip, rale_port, dstore_port });
    }
    Ok(peers)
}
