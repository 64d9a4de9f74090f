//! Node descriptor and the small enums that describe its state.

use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const NAME_MAX: usize = 254;
pub const IP_ADDR_MAX: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Leader,
    Candidate,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Inactive,
    Failed,
}

/// A single cluster member as tracked by the membership registry.
///
/// `last_heartbeat` is transient (not persisted to `cluster.state`); it is
/// reset to "now" whenever the descriptor is reloaded from disk.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub id: i32,
    pub name: String,
    pub ip: String,
    pub rale_port: u16,
    pub dstore_port: u16,
    pub priority: i32,
    pub state: NodeState,
    pub status: NodeStatus,
    pub term: u32,
    pub last_log_index: u64,
    pub last_log_term: u32,
    pub last_heartbeat: Instant,
    pub is_voting_member: bool,
}

impl NodeDescriptor {
    pub fn new(id: i32, name: String, ip: String, rale_port: u16, dstore_port: u16) -> Self {
        Self {
            id,
            name,
            ip,
            rale_port,
            dstore_port,
            priority: 0,
            state: NodeState::Offline,
            status: NodeStatus::Active,
            term: 0,
            last_log_index: 0,
            last_log_term: 0,
            last_heartbeat: Instant::now(),
            is_voting_member: true,
        }
    }
}
