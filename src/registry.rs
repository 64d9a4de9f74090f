//! Membership registry: a bounded table of peer descriptors, persisted to
//! `cluster.state`.
//!
//! A fixed array with `id == -1` marking an empty slot is one way to
//! represent this; here it collapses to `Vec<NodeDescriptor>` under a
//! single mutex, with `remove` shifting later slots down to preserve
//! order (same externally-observable behavior, no sentinel needed).

use crate::error::{RaleError, Result};
use crate::node::{NodeDescriptor, NodeState, NodeStatus, IP_ADDR_MAX, NAME_MAX};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::Mutex;

pub const MAX_NODES: usize = 10;

/// Validation ceiling the original registry enforces on `add`: ids larger
/// than this are rejected even though `MAX_NODES` is much smaller, since the
/// id space is meant to outlive any single cluster's membership.
const MAX_NODE_ID: i32 = 1000;
/// Validation ceiling on `ip`, stricter than the `IP_ADDR_MAX` storage
/// field.
const MAX_IP_VALIDATE_LEN: usize = 46;

struct Inner {
    nodes: Vec<NodeDescriptor>,
    self_id: i32,
    state_file: Option<PathBuf>,
}

/// Bounded, mutex-protected cluster membership table.
///
/// All accessors return owned copies so callers never hold a reference
/// into registry-internal state across an `.await`.
pub struct ClusterRegistry {
    inner: Mutex<Inner>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: Vec::with_capacity(MAX_NODES),
                self_id: -1,
                state_file: None,
            }),
        }
    }

    pub async fn set_state_file(&self, path: impl AsRef<Path>) {
        let mut inner = self.inner.lock().await;
        inner.state_file = Some(path.as_ref().to_path_buf());
    }

    pub async fn set_self(&self, id: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.self_id = id;
        Self::persist(&inner);
        Ok(())
    }

    pub async fn get_self(&self) -> i32 {
        self.inner.lock().await.self_id
    }

    pub async fn count(&self) -> u32 {
        self.inner.lock().await.nodes.len() as u32
    }

    pub async fn add(
        &self,
        id: i32,
        name: &str,
        ip: &str,
        rale_port: u16,
        dstore_port: u16,
    ) -> Result<()> {
        validate_id(id)?;
        validate_name(name)?;
        validate_ip(ip)?;
        validate_port(rale_port)?;
        validate_port(dstore_port)?;

        let mut inner = self.inner.lock().await;
        if inner.nodes.len() >= MAX_NODES {
            return Err(RaleError::Resource(format!(
                "registry is full (max {MAX_NODES} nodes)"
            )));
        }
        if inner.nodes.iter().any(|n| n.id == id) {
            return Err(RaleError::Validation(format!(
                "node id {id} already present"
            )));
        }

        inner.nodes.push(NodeDescriptor::new(
            id,
            name.to_string(),
            ip.to_string(),
            rale_port,
            dstore_port,
        ));
        Self::persist(&inner);
        Ok(())
    }

    pub async fn remove(&self, id: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let before = inner.nodes.len();
        inner.nodes.retain(|n| n.id != id);
        if inner.nodes.len() == before {
            return Err(RaleError::Validation(format!("node id {id} not found")));
        }
        Self::persist(&inner);
        Ok(())
    }

    pub async fn get_by_id(&self, id: i32) -> Option<NodeDescriptor> {
        self.inner
            .lock()
            .await
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    pub async fn get_by_index(&self, index: usize) -> Option<NodeDescriptor> {
        self.inner.lock().await.nodes.get(index).cloned()
    }

    pub async fn all(&self) -> Vec<NodeDescriptor> {
        self.inner.lock().await.nodes.clone()
    }

    /// Accept a `PROPAGATE_ADD` from a peer. Duplicate ids are a no-op.
    pub async fn propagate_add(
        &self,
        id: i32,
        name: &str,
        ip: &str,
        rale_port: u16,
        dstore_port: u16,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.nodes.iter().any(|n| n.id == id) {
            return Ok(());
        }
        if inner.nodes.len() >= MAX_NODES {
            return Err(RaleError::Resource(format!(
                "registry is full (max {MAX_NODES} nodes)"
            )));
        }
        inner.nodes.push(NodeDescriptor::new(
            id,
            name.to_string(),
            ip.to_string(),
            rale_port,
            dstore_port,
        ));
        Self::persist(&inner);
        Ok(())
    }

    pub async fn propagate_remove(&self, id: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.nodes.retain(|n| n.id != id);
        Self::persist(&inner);
        Ok(())
    }

    /// Set the informational priority tie-breaking hint on a node
    /// descriptor. Never consulted by the election algorithm itself
    /// (spec.md keeps election purely term/quorum-based); exposed only
    /// via `STATUS`/`LIST`.
    pub async fn set_priority(&self, id: i32, priority: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(node) = inner.nodes.iter_mut().find(|n| n.id == id) else {
            return Err(RaleError::Validation(format!("node id {id} not found")));
        };
        node.priority = priority;
        Self::persist(&inner);
        Ok(())
    }

    pub async fn update_heartbeat(&self, id: i32, term: u32, state: NodeState) {
        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.nodes.iter_mut().find(|n| n.id == id) {
            node.term = term;
            node.state = state;
            node.status = NodeStatus::Active;
            node.last_heartbeat = Instant::now();
        }
    }

    /// Best-effort rewrite of `cluster.state`. Failures are swallowed:
    /// persistence of the registry is advisory, not required for
    /// correctness of the in-memory view.
    fn persist(inner: &Inner) {
        let Some(path) = inner.state_file.as_ref() else {
            return;
        };
        let mut out = String::new();
        out.push_str(&format!("self_id={}\n", inner.self_id));
        out.push_str(&format!("node_count={}\n", inner.nodes.len()));
        for (i, node) in inner.nodes.iter().enumerate() {
            out.push_str(&format!("node[{i}].id={}\n", node.id));
            out.push_str(&format!("node[{i}].name={}\n", node.name));
            out.push_str(&format!("node[{i}].ip={}\n", node.ip));
            out.push_str(&format!("node[{i}].rale_port={}\n", node.rale_port));
            out.push_str(&format!("node[{i}].dstore_port={}\n", node.dstore_port));
        }
        let _ = std::fs::write(path, out);
    }

    /// Load `cluster.state`. A missing file means first boot (empty
    /// registry, not an error). A file whose `node_count` line fails to
    /// parse resets to an empty registry rather than propagating an
    /// error, tolerating unknown keys and truncated files.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.set_state_file(path).await;
                return Ok(());
            }
            Err(e) => return Err(RaleError::Storage(e.to_string())),
        };

        let mut self_id = -1i32;
        let mut node_count: usize = 0;
        let mut parsed_count = false;
        let mut partial: Vec<PartialNode> = Vec::new();

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key == "self_id" {
                self_id = value.parse().unwrap_or(-1);
            } else if key == "node_count" {
                match value.parse::<usize>() {
                    Ok(n) => {
                        node_count = n;
                        parsed_count = true;
                        partial.resize_with(n, PartialNode::default);
                    }
                    Err(_) => {
                        parsed_count = false;
                        break;
                    }
                }
            } else if let Some(rest) = key.strip_prefix("node[") {
                if let Some((idx_str, field)) = rest.split_once("].") {
                    if let Ok(idx) = idx_str.parse::<usize>() {
                        if idx < partial.len() {
                            partial[idx].apply(field, value);
                        }
                    }
                }
            }
            // Unknown keys are tolerated silently.
        }

        let mut inner = self.inner.lock().await;
        inner.state_file = Some(path.to_path_buf());
        if !parsed_count {
            inner.nodes.clear();
            inner.self_id = -1;
            return Ok(());
        }
        inner.self_id = self_id;
        inner.nodes = partial
            .into_iter()
            .take(node_count)
            .filter_map(|p| p.into_descriptor())
            .collect();
        Ok(())
    }
}

#[derive(Default)]
struct PartialNode {
    id: Option<i32>,
    name: Option<String>,
    ip: Option<String>,
    rale_port: Option<u16>,
    dstore_port: Option<u16>,
}

impl PartialNode {
    fn apply(&mut self, field: &str, value: &str) {
        match field {
            "id" => self.id = value.parse().ok(),
            "name" => self.name = Some(value.to_string()),
            "ip" => self.ip = Some(value.to_string()),
            "rale_port" => self.rale_port = value.parse().ok(),
            "dstore_port" => self.dstore_port = value.parse().ok(),
            _ => {}
        }
    }

    fn into_descriptor(self) -> Option<NodeDescriptor> {
        Some(NodeDescriptor::new(
            self.id?,
            self.name?,
            self.ip?,
            self.rale_port?,
            self.dstore_port?,
        ))
    }
}

fn validate_id(id: i32) -> Result<()> {
    if id <= 0 || id > MAX_NODE_ID {
        return Err(RaleError::Validation(format!(
            "node id {id} out of range (0, {MAX_NODE_ID}]"
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(RaleError::Validation(format!(
            "node name must be non-empty and at most {NAME_MAX} chars"
        )));
    }
    Ok(())
}

fn validate_ip(ip: &str) -> Result<()> {
    if ip.is_empty() || ip.len() > MAX_IP_VALIDATE_LEN || ip.len() > IP_ADDR_MAX {
        return Err(RaleError::Validation(format!(
            "ip must be non-empty and at most {MAX_IP_VALIDATE_LEN} chars"
        )));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(RaleError::Validation("port must be in [1, 65535]".into()));
    }
    Ok(())
}
