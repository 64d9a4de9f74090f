//! RALE: the leader-election and heartbeat state machine.
//!
//! Protocol semantics follow a Raft-style term/vote/heartbeat model:
//! role enum, state behind `Arc<Mutex<_>>`, `tokio::time::sleep`-driven
//! timers spawned as independent tasks, and a persist-before-reply
//! discipline for every state transition.

use crate::error::Result;
use crate::node::NodeState;
use crate::registry::ClusterRegistry;
use crate::state_store::{PersistedRaleState, RaleStateStore};
use crate::udp::UdpTransport;
use log::{debug, info, warn};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Transitioning,
}

pub struct RaleConfig {
    pub self_id: i32,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
}

struct Inner {
    role: Role,
    current_term: u32,
    voted_for: i32,
    leader_id: i32,
    last_heartbeat: Instant,
    election_deadline: Instant,
    votes_received: u32,
    election_active: bool,
    next_heartbeat_at: Instant,
    next_vote_request_at: Instant,
}

/// A published, watchable view of leader identity — the single
/// in-process authoritative value, replacing a design with two channels
/// of truth (process RAM vs. a `rale.state` reread by DStore on every
/// `PUT`).
pub struct LeaderCell {
    term: AtomicU32,
    leader_id: AtomicI32,
}

impl LeaderCell {
    fn new() -> Self {
        Self {
            term: AtomicU32::new(0),
            leader_id: AtomicI32::new(-1),
        }
    }

    pub fn get(&self) -> (u32, i32) {
        (self.term.load(Ordering::Acquire), self.leader_id.load(Ordering::Acquire))
    }

    fn set(&self, term: u32, leader_id: i32) {
        self.term.store(term, Ordering::Release);
        self.leader_id.store(leader_id, Ordering::Release);
    }
}

/// The RALE node: role, term, and vote state behind a single mutex, plus
/// the published `LeaderCell` and the persistent state store.
pub struct RaleNode {
    pub self_id: i32,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    inner: Mutex<Inner>,
    pub leader_cell: LeaderCell,
    store: RaleStateStore,
    pub registry: Arc<ClusterRegistry>,
    pub udp: UdpTransport,
    /// Local pseudo-command channel for `LEADER_ELECTED`: wired by the
    /// daemon entry point to DStore's `on_leader_elected`, so that winning
    /// an election also broadcasts a `LEADER` snapshot over the DStore
    /// mesh instead of relying only on the next heartbeat reaching every
    /// peer.
    elected_tx: Mutex<Option<mpsc::UnboundedSender<(u32, i32)>>>,
}

impl RaleNode {
    pub async fn new(
        config: RaleConfig,
        db_path: impl AsRef<std::path::Path>,
        registry: Arc<ClusterRegistry>,
        udp: UdpTransport,
    ) -> Result<Arc<Self>> {
        let store = RaleStateStore::new(db_path);
        let persisted = store.read_state()?;
        let now = Instant::now();

        let node = Arc::new(Self {
            self_id: config.self_id,
            heartbeat_interval: config.heartbeat_interval,
            election_timeout: config.election_timeout,
            inner: Mutex::new(Inner {
                role: Role::Follower,
                current_term: persisted.current_term,
                voted_for: persisted.voted_for,
                leader_id: persisted.leader_id,
                last_heartbeat: now,
                election_deadline: Self::random_deadline(config.election_timeout),
                votes_received: 0,
                election_active: false,
                next_heartbeat_at: now,
                next_vote_request_at: now,
            }),
            leader_cell: LeaderCell::new(),
            store,
            registry,
            udp,
            elected_tx: Mutex::new(None),
        });
        if persisted.leader_id >= 0 {
            node.leader_cell.set(persisted.current_term, persisted.leader_id);
        }
        Ok(node)
    }

    fn persist(&self, inner: &Inner) {
        let state = PersistedRaleState {
            current_term: inner.current_term,
            voted_for: inner.voted_for,
            leader_id: inner.leader_id,
            last_log_index: 0,
            last_log_term: 0,
        };
        if let Err(e) = self.store.write_state(state) {
            warn!("[{}] failed to persist rale.state: {e}", self.self_id);
        }
    }

    /// Register the channel that carries the `LEADER_ELECTED` pseudo-
    /// command out to DStore. Called once by the daemon entry point
    /// after both `RaleNode` and `DStore` exist.
    pub async fn set_elected_sender(&self, tx: mpsc::UnboundedSender<(u32, i32)>) {
        *self.elected_tx.lock().await = Some(tx);
    }

    pub async fn role(&self) -> Role {
        self.inner.lock().await.role
    }

    pub async fn current_term(&self) -> u32 {
        self.inner.lock().await.current_term
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.role == Role::Leader
    }

    pub async fn leader_id(&self) -> i32 {
        self.inner.lock().await.leader_id
    }

    pub async fn status(&self) -> (Role, u32, i32, i32, Instant, Instant) {
        let i = self.inner.lock().await;
        (i.role, i.current_term, i.leader_id, i.voted_for, i.last_heartbeat, i.election_deadline)
    }

    /// Uniformly random in `[timeout, 2*timeout]`, per spec.md §4.6.
    fn random_deadline(election_timeout: Duration) -> Instant {
        let base = election_timeout.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(base..=(base * 2));
        Instant::now() + Duration::from_millis(ms)
    }

    fn random_election_deadline(&self) -> Instant {
        Self::random_deadline(self.election_timeout)
    }

    /// Broadcast `msg` to every non-self, voting-member peer.
    async fn broadcast(&self, msg: &str) {
        for node in self.registry.all().await {
            if node.id == self.self_id {
                continue;
            }
            let addr: SocketAddr = match format!("{}:{}", node.ip, node.rale_port).parse() {
                Ok(a) => a,
                Err(_) => continue,
            };
            if let Err(e) = self.udp.send_to(msg, addr).await {
                debug!("[{}] failed to send to {}: {e}", self.self_id, node.id);
            }
        }
    }

    /// Start a new election: increment term, vote for self, broadcast
    /// `VOTE_REQUEST`.
    pub async fn start_election(self: &Arc<Self>) {
        let term = {
            let mut inner = self.inner.lock().await;
            inner.role = Role::Candidate;
            inner.current_term += 1;
            inner.voted_for = self.self_id;
            inner.votes_received = 1;
            inner.election_active = true;
            inner.election_deadline = self.random_election_deadline();
            inner.next_vote_request_at = Instant::now() + Duration::from_secs(1);
            self.persist(&inner);
            info!("[{}] starting election for term {}", self.self_id, inner.current_term);
            inner.current_term
        };
        self.broadcast(&format!("VOTE_REQUEST {} {}", self.self_id, term)).await;
    }

    /// Handle an inbound RALE datagram. Returns an optional reply to send
    /// back to `from`.
    pub async fn handle_message(self: &Arc<Self>, msg: &str) -> Option<String> {
        let mut parts = msg.split_whitespace();
        let verb = parts.next()?;
        match verb {
            "VOTE_REQUEST" => {
                let candidate_id: i32 = parts.next()?.parse().ok()?;
                let term: u32 = parts.next()?.parse().ok()?;
                Some(self.on_vote_request(candidate_id, term).await)
            }
            "VOTE_GRANTED" => {
                let voter_id: i32 = parts.next()?.parse().ok()?;
                let term: u32 = parts.next()?.parse().ok()?;
                self.on_vote_granted(voter_id, term).await;
                None
            }
            "VOTE_DENIED" => None,
            "HEARTBEAT" => {
                let leader_id: i32 = parts.next()?.parse().ok()?;
                let term: u32 = parts.next()?.parse().ok()?;
                self.on_heartbeat(leader_id, term).await;
                Some("HEARTBEAT_ACK".to_string())
            }
            "HEARTBEAT_ACK" => None,
            _ => {
                debug!("[{}] ignoring malformed RALE message: {msg}", self.self_id);
                None
            }
        }
    }

    async fn on_vote_request(&self, candidate_id: i32, term: u32) -> String {
        let mut inner = self.inner.lock().await;

        if term > inner.current_term {
            inner.current_term = term;
            inner.voted_for = -1;
            inner.role = Role::Follower;
            inner.leader_id = -1;
            self.persist(&inner);
        }

        if term < inner.current_term {
            return format!("VOTE_DENIED {} {}", self.self_id, inner.current_term);
        }

        if inner.role != Role::Leader && (inner.voted_for == -1 || inner.voted_for == candidate_id) {
            inner.voted_for = candidate_id;
            inner.election_deadline = self.random_election_deadline();
            self.persist(&inner);
            format!("VOTE_GRANTED {} {}", self.self_id, inner.current_term)
        } else {
            format!("VOTE_DENIED {} {}", self.self_id, inner.current_term)
        }
    }

    async fn on_vote_granted(self: &Arc<Self>, _voter_id: i32, term: u32) {
        let became_leader = {
            let mut inner = self.inner.lock().await;
            if !inner.election_active || term > inner.current_term {
                return;
            }
            inner.votes_received += 1;
            let node_count = self.registry.count().await.max(1);
            if inner.votes_received > node_count / 2 && inner.role == Role::Candidate {
                inner.role = Role::Leader;
                inner.leader_id = self.self_id;
                inner.election_active = false;
                self.persist(&inner);
                self.leader_cell.set(inner.current_term, self.self_id);
                info!("[{}] elected leader for term {}", self.self_id, inner.current_term);
                Some(inner.current_term)
            } else {
                None
            }
        };

        if let Some(term) = became_leader {
            self.registry.update_heartbeat(self.self_id, term, NodeState::Leader).await;
            if let Some(tx) = self.elected_tx.lock().await.as_ref() {
                let _ = tx.send((term, self.self_id));
            }
            self.send_heartbeat().await;
        }
    }

    async fn on_heartbeat(&self, leader_id: i32, term: u32) {
        let adopted_term = {
            let mut inner = self.inner.lock().await;
            if term > inner.current_term {
                inner.current_term = term;
                inner.voted_for = -1;
            }
            if leader_id >= 0 {
                inner.role = Role::Follower;
                inner.leader_id = leader_id;
                inner.last_heartbeat = Instant::now();
                inner.election_deadline = self.random_election_deadline();
                self.persist(&inner);
                self.leader_cell.set(inner.current_term, leader_id);
                Some(inner.current_term)
            } else {
                None
            }
        };
        if let Some(term) = adopted_term {
            self.registry.update_heartbeat(leader_id, term, NodeState::Leader).await;
        }
    }

    /// Apply a `LEADER <term> <leader_id>` snapshot received over DStore.
    pub async fn apply_leader_snapshot(&self, term: u32, leader_id: i32) {
        let mut inner = self.inner.lock().await;
        if term >= inner.current_term {
            inner.current_term = term;
            inner.leader_id = leader_id;
            if leader_id != self.self_id {
                inner.role = Role::Follower;
            }
            self.persist(&inner);
            self.leader_cell.set(term, leader_id);
        }
    }

    /// Follower/candidate/leader duty: checked once per tick by the
    /// scheduler. Heartbeats and vote-request re-broadcasts are gated on
    /// their own intervals rather than fired every tick.
    pub async fn check_timers(self: &Arc<Self>) {
        let (role, deadline_passed, heartbeat_due, vote_request_due) = {
            let inner = self.inner.lock().await;
            let now = Instant::now();
            (
                inner.role,
                now >= inner.election_deadline,
                now >= inner.next_heartbeat_at,
                now >= inner.next_vote_request_at,
            )
        };
        match role {
            Role::Follower if deadline_passed => {
                self.start_election().await;
            }
            Role::Candidate if deadline_passed => {
                self.start_election().await;
            }
            Role::Candidate if vote_request_due => {
                self.rebroadcast_vote_request().await;
            }
            Role::Leader if heartbeat_due => {
                self.send_heartbeat().await;
            }
            _ => {}
        }
    }

    /// Leader duty: broadcast `HEARTBEAT` and schedule the next one
    /// `heartbeat_interval` out.
    async fn send_heartbeat(&self) {
        let term = {
            let mut inner = self.inner.lock().await;
            inner.next_heartbeat_at = Instant::now() + self.heartbeat_interval;
            inner.current_term
        };
        self.broadcast(&format!("HEARTBEAT {} {}", self.self_id, term)).await;
    }

    /// Candidate duty: re-send `VOTE_REQUEST` for the still-active
    /// election at most once per second until the election deadline,
    /// so a dropped UDP request doesn't force a full term bump.
    async fn rebroadcast_vote_request(&self) {
        let term = {
            let mut inner = self.inner.lock().await;
            inner.next_vote_request_at = Instant::now() + Duration::from_secs(1);
            inner.current_term
        };
        self.broadcast(&format!("VOTE_REQUEST {} {}", self.self_id, term)).await;
    }

    /// Spawn the background duty loops (election timer, heartbeat
    /// sender) and the UDP dispatch loop.
    pub fn start(self: &Arc<Self>, mut udp_rx: mpsc::UnboundedReceiver<(SocketAddr, String)>) {
        let dispatch_node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((from, msg)) = udp_rx.recv().await {
                if let Some(reply) = dispatch_node.handle_message(&msg).await {
                    let _ = dispatch_node.udp.send_to(&reply, from).await;
                }
            }
        });

        let timer_node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                timer_node.check_timers().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClusterRegistry;

    async fn node(id: i32, port: u16, timeout_ms: u64) -> Arc<RaleNode> {
        let registry = Arc::new(ClusterRegistry::new());
        let (udp, rx) = UdpTransport::bind(port).await.unwrap();
        drop(rx);
        let dir = tempfile::tempdir().unwrap();
        let cfg = RaleConfig {
            self_id: id,
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(timeout_ms),
        };
        RaleNode::new(cfg, dir.path(), registry, udp).await.unwrap()
    }

    #[tokio::test]
    async fn starts_as_follower() {
        let n = node(1, 0, 200).await;
        assert_eq!(n.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn vote_request_with_lower_term_is_denied() {
        let n = node(1, 0, 200).await;
        {
            let mut inner = n.inner.lock().await;
            inner.current_term = 5;
        }
        let reply = n.on_vote_request(2, 3).await;
        assert!(reply.starts_with("VOTE_DENIED"));
    }

    #[tokio::test]
    async fn vote_request_with_higher_term_adopts_and_grants() {
        let n = node(1, 0, 200).await;
        let reply = n.on_vote_request(2, 9).await;
        assert_eq!(reply, "VOTE_GRANTED 1 9");
        assert_eq!(n.current_term().await, 9);
    }

    #[tokio::test]
    async fn single_vote_per_term_is_idempotent_for_same_candidate() {
        let n = node(1, 0, 200).await;
        let first = n.on_vote_request(2, 4).await;
        let second = n.on_vote_request(2, 4).await;
        assert_eq!(first, "VOTE_GRANTED 1 4");
        assert_eq!(second, "VOTE_GRANTED 1 4");
    }

    #[tokio::test]
    async fn second_distinct_candidate_same_term_is_denied() {
        let n = node(1, 0, 200).await;
        let first = n.on_vote_request(2, 4).await;
        let second = n.on_vote_request(3, 4).await;
        assert_eq!(first, "VOTE_GRANTED 1 4");
        assert!(second.starts_with("VOTE_DENIED"));
    }

    #[tokio::test]
    async fn heartbeat_resets_role_and_leader() {
        let n = node(1, 0, 200).await;
        n.start_election().await;
        assert_eq!(n.role().await, Role::Candidate);
        n.on_heartbeat(2, 10).await;
        assert_eq!(n.role().await, Role::Follower);
        assert_eq!(n.leader_id().await, 2);
    }

    #[tokio::test]
    async fn heartbeat_marks_leader_in_registry() {
        let n = node(1, 0, 200).await;
        n.registry.add(2, "n2", "127.0.0.1", 5002, 6002).await.unwrap();
        n.on_heartbeat(2, 10).await;
        let peer = n.registry.get_by_id(2).await.unwrap();
        assert_eq!(peer.state, crate::node::NodeState::Leader);
        assert_eq!(peer.term, 10);
    }

    #[tokio::test]
    async fn winning_election_notifies_the_elected_channel() {
        let n = node(1, 0, 200).await;
        n.registry.add(1, "n1", "127.0.0.1", 5001, 6001).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        n.set_elected_sender(tx).await;
        n.start_election().await;
        n.on_vote_granted(1, n.current_term().await).await;
        let (term, leader_id) = rx.recv().await.unwrap();
        assert_eq!(leader_id, 1);
        assert_eq!(term, n.current_term().await);
    }

    #[tokio::test]
    async fn leader_snapshot_prefers_real_term() {
        let n = node(1, 0, 200).await;
        n.apply_leader_snapshot(5, 3).await;
        let (term, leader) = n.leader_cell.get();
        assert_eq!(term, 5);
        assert_eq!(leader, 3);
    }

    #[tokio::test]
    async fn term_is_non_decreasing_across_persistence_barrier() {
        let n = node(1, 0, 200).await;
        let before = n.current_term().await;
        n.on_vote_request(2, before + 1).await;
        let after = n.current_term().await;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn initial_election_deadline_is_randomized_within_the_spec_window() {
        let timeout = Duration::from_millis(1000);
        let before = Instant::now();
        let n = node(1, 0, timeout.as_millis() as u64).await;
        let (_, _, _, _, _, deadline) = n.status().await;
        assert!(
            deadline >= before + timeout - Duration::from_millis(50),
            "deadline must be at least ~timeout out, not a fixed single-timeout value"
        );
        assert!(
            deadline <= before + timeout * 2 + Duration::from_millis(100),
            "deadline must not exceed 2*timeout"
        );
    }

    #[tokio::test]
    async fn leader_skips_heartbeat_before_interval_elapses() {
        let n = node(1, 0, 200).await;
        let scheduled = {
            let mut inner = n.inner.lock().await;
            inner.role = Role::Leader;
            inner.next_heartbeat_at = Instant::now() + Duration::from_secs(10);
            inner.next_heartbeat_at
        };
        n.check_timers().await;
        assert_eq!(n.inner.lock().await.next_heartbeat_at, scheduled);
    }

    #[tokio::test]
    async fn leader_sends_heartbeat_once_interval_elapses_and_reschedules() {
        let n = node(1, 0, 200).await;
        {
            let mut inner = n.inner.lock().await;
            inner.role = Role::Leader;
            inner.next_heartbeat_at = Instant::now() - Duration::from_millis(1);
        }
        let before = Instant::now();
        n.check_timers().await;
        let next = n.inner.lock().await.next_heartbeat_at;
        assert!(next > before, "next heartbeat should be rescheduled heartbeat_interval out");
    }

    #[tokio::test]
    async fn candidate_rebroadcasts_vote_request_without_bumping_term() {
        let n = node(1, 0, 200).await;
        n.start_election().await;
        let term_before = n.current_term().await;
        {
            let mut inner = n.inner.lock().await;
            inner.next_vote_request_at = Instant::now() - Duration::from_millis(1);
        }
        n.check_timers().await;
        assert_eq!(n.current_term().await, term_before, "re-broadcast must not bump the term");
        assert_eq!(n.role().await, Role::Candidate);
    }
}
