//! DStore: the TCP-based replicated key-value store layered on the
//! RALE-elected leader.
//!
//! Message dispatch (parse one line, match on the leading verb, mutate
//! shared state under a lock, write a reply) follows a simple
//! request-handling pattern common to line-oriented TCP protocols. Every
//! peer runs a full mesh of persistent outbound `TcpClient`s, one per
//! peer; the accepted server side exists to receive those peers' writes
//! and to answer HELLO with a snapshot, since a connection is not
//! attributed to a peer until a HELLO arrives on it.

use crate::error::{RaleError, Result};
use crate::kv::{KvStore, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::rale::RaleNode;
use crate::registry::ClusterRegistry;
use crate::state_store::RaleStateStore;
use crate::tcp::{ServerEvent, TcpClientPool, TcpServer};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// "PUT " + key + "=" + value + small leeway.
const MESSAGE_SIZE_BUDGET: usize = MAX_KEY_SIZE + MAX_VALUE_SIZE + 16;

enum ReplySink {
    ServerSlot(usize),
    ClientAddr(String),
    None,
}

struct PeerLinkState {
    handshake_sent: bool,
    last_keep_alive_sent: Instant,
}

pub struct DStore {
    self_id: i32,
    kv: KvStore,
    journal: RaleStateStore,
    rale: Arc<RaleNode>,
    registry: Arc<ClusterRegistry>,
    server: TcpServer,
    clients: Mutex<TcpClientPool>,
    slot_peer: Mutex<HashMap<usize, i32>>,
    link_state: Mutex<HashMap<i32, PeerLinkState>>,
    keep_alive_interval: Duration,
}

impl DStore {
    pub async fn new(
        self_id: i32,
        dstore_port: u16,
        db_path: impl AsRef<std::path::Path>,
        rale: Arc<RaleNode>,
        registry: Arc<ClusterRegistry>,
        keep_alive_interval: Duration,
    ) -> Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>)> {
        let (server, events) = TcpServer::bind(dstore_port).await?;
        let store = Arc::new(Self {
            self_id,
            kv: KvStore::new(),
            journal: RaleStateStore::new(db_path),
            rale,
            registry,
            server,
            clients: Mutex::new(TcpClientPool::new()),
            slot_peer: Mutex::new(HashMap::new()),
            link_state: Mutex::new(HashMap::new()),
            keep_alive_interval,
        });

        // Reload the on-disk journal before accepting traffic.
        for (k, v) in store.journal.load_journal()? {
            store.kv.put(k.as_bytes(), v.as_bytes()).await?;
        }

        Ok((store, events))
    }

    /// Spawn the server-event dispatch loop and the periodic client tick
    /// (connect/keepalive/handshake), expressed as two long-running tasks
    /// instead of a single-threaded poll loop.
    pub fn start(
        self: &Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let dispatch = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch.on_server_event(event).await;
            }
        });

        let ticker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                ticker.client_tick().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });
    }

    async fn on_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::Connected { slot, ip, port } => {
                debug!("[{}] dstore connection established from {ip}:{port} (slot {slot})", self.self_id);
            }
            ServerEvent::Line { slot, line } => {
                self.process_command(&line, ReplySink::ServerSlot(slot)).await;
            }
            ServerEvent::Disconnected { slot, .. } => {
                self.slot_peer.lock().await.remove(&slot);
            }
        }
    }

    /// One connection-attempt-and-keepalive pass over every configured
    /// peer.
    async fn client_tick(self: &Arc<Self>) {
        let peers = self.registry.all().await;
        for node in &peers {
            if node.id == self.self_id {
                continue;
            }
            let addr = format!("{}:{}", node.ip, node.dstore_port);
            let client = self.get_or_connect(&addr).await;
            if client.is_connected() {
                self.ensure_handshake(node.id, &addr).await;
                self.maybe_keep_alive(node.id, &addr).await;
            }
        }
    }

    async fn ensure_handshake(self: &Arc<Self>, peer_id: i32, addr: &str) {
        let needs_handshake = {
            let mut state = self.link_state.lock().await;
            let entry = state.entry(peer_id).or_insert(PeerLinkState {
                handshake_sent: false,
                last_keep_alive_sent: Instant::now() - self.keep_alive_interval,
            });
            let needed = !entry.handshake_sent;
            entry.handshake_sent = true;
            needed
        };
        if needs_handshake {
            self.send_to_addr(addr, &format!("HELLO {}", self.self_id)).await;
            self.send_to_addr(addr, "KEEP_ALIVE").await;
            self.send_snapshot_to_addr(addr).await;
        }
    }

    async fn maybe_keep_alive(self: &Arc<Self>, peer_id: i32, addr: &str) {
        let due = {
            let mut state = self.link_state.lock().await;
            let entry = state.entry(peer_id).or_insert(PeerLinkState {
                handshake_sent: true,
                last_keep_alive_sent: Instant::now() - self.keep_alive_interval,
            });
            if entry.last_keep_alive_sent.elapsed() >= self.keep_alive_interval {
                entry.last_keep_alive_sent = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.send_to_addr(addr, "KEEP_ALIVE").await;
        }
    }

    async fn send_snapshot_to_addr(self: &Arc<Self>, addr: &str) {
        for node in self.registry.all().await {
            let msg = format!(
                "PROPAGATE_ADD {} {} {} {} {}",
                node.id, node.name, node.ip, node.rale_port, node.dstore_port
            );
            self.send_to_addr(addr, &msg).await;
        }
        let (term, leader_id) = self.rale.leader_cell.get();
        self.send_to_addr(addr, &format!("LEADER {term} {leader_id}")).await;
    }

    async fn send_to_addr(self: &Arc<Self>, addr: &str, msg: &str) {
        if msg.len() > MESSAGE_SIZE_BUDGET {
            warn!("[{}] dropping oversized message to {addr}", self.self_id);
            return;
        }
        let client = self.get_or_connect(addr).await;
        if let Err(e) = client.send(msg).await {
            debug!("[{}] send to {addr} failed: {e}", self.self_id);
        }
    }

    async fn reply(self: &Arc<Self>, sink: &ReplySink, msg: &str) {
        match sink {
            ReplySink::ServerSlot(slot) => {
                if let Err(e) = self.server.send(*slot, msg).await {
                    debug!("[{}] reply to slot {slot} failed: {e}", self.self_id);
                }
            }
            ReplySink::ClientAddr(addr) => self.send_to_addr(addr, msg).await,
            ReplySink::None => {}
        }
    }

    /// Broadcast `msg` to every connected peer via our outbound client
    /// pool — the full mesh makes this equivalent to every non-self
    /// connected peer.
    async fn broadcast_to_peers(self: &Arc<Self>, msg: &str) {
        let addrs: Vec<String> = {
            let pool = self.clients.lock().await;
            pool.all()
                .filter(|c| c.is_connected())
                .map(|c| c.addr_string())
                .collect()
        };
        for addr in addrs {
            self.send_to_addr(&addr, msg).await;
        }
    }

    /// Fetch (or create) the pooled outbound client for `addr`. Newly
    /// created clients have their connect-and-read loop spawned here,
    /// with inbound lines dispatched back through `process_command`
    /// tagged with `ReplySink::ClientAddr` — this is what lets a `GET`
    /// forwarded over an outbound link receive its `VALUE`/`NOT_FOUND`
    /// reply on the same connection.
    async fn get_or_connect(self: &Arc<Self>, addr: &str) -> Arc<crate::tcp::TcpClient> {
        let (client, newly_created) = {
            let mut pool = self.clients.lock().await;
            pool.get_or_connect(addr)
        };
        if let Some(fresh) = newly_created {
            let mut lines = Arc::clone(&fresh).spawn();
            let dispatch = Arc::clone(self);
            let addr = addr.to_string();
            tokio::spawn(async move {
                while let Some((_, line)) = lines.recv().await {
                    dispatch.process_command(&line, ReplySink::ClientAddr(addr.clone())).await;
                }
            });
        }
        client
    }

    fn leader_addr(&self, leader_id: i32, nodes: &[crate::node::NodeDescriptor]) -> Option<String> {
        nodes
            .iter()
            .find(|n| n.id == leader_id)
            .map(|n| format!("{}:{}", n.ip, n.dstore_port))
    }

    /// `PUT key=value` entry point for both the control socket and the
    /// wire protocol's own `PUT` verb.
    pub async fn handle_put(self: &Arc<Self>, key: &str, value: &str) -> Result<()> {
        if key.len() > MAX_KEY_SIZE || value.len() > MAX_VALUE_SIZE {
            return Err(RaleError::Validation("key or value too large".into()));
        }
        if self.rale.is_leader().await {
            self.apply_local(key, value).await?;
            self.broadcast_to_peers(&format!("PUT {key}={value}")).await;
            Ok(())
        } else {
            self.forward_to_leader(&format!("FORWARD_PUT {key}={value}")).await
        }
    }

    pub async fn handle_delete(self: &Arc<Self>, key: &str) -> Result<()> {
        if self.rale.is_leader().await {
            self.kv.delete(key.as_bytes()).await;
            self.broadcast_to_peers(&format!("DELETE {key}")).await;
            Ok(())
        } else {
            self.forward_to_leader(&format!("FORWARD_DELETE {key}")).await
        }
    }

    pub async fn handle_get(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.get(key.as_bytes()).await
    }

    async fn apply_local(&self, key: &str, value: &str) -> Result<()> {
        self.kv.put(key.as_bytes(), value.as_bytes()).await?;
        self.journal.append_journal(key, value)?;
        Ok(())
    }

    async fn forward_to_leader(self: &Arc<Self>, msg: &str) -> Result<()> {
        let (_, leader_id) = self.rale.leader_cell.get();
        if leader_id < 0 {
            return Err(RaleError::Consensus("no known leader to forward to".into()));
        }
        let nodes = self.registry.all().await;
        let Some(addr) = self.leader_addr(leader_id, &nodes) else {
            return Err(RaleError::Consensus(format!("leader {leader_id} not in registry")));
        };
        let client = self.get_or_connect(&addr).await;
        client.send(msg).await
    }

    /// Called by RALE when this node wins an election: persist and
    /// broadcast a `LEADER` snapshot to every connected peer.
    pub async fn on_leader_elected(self: &Arc<Self>, term: u32, leader_id: i32) {
        self.rale.apply_leader_snapshot(term, leader_id).await;
        self.broadcast_to_peers(&format!("LEADER {term} {leader_id}")).await;
    }

    async fn process_command(self: &Arc<Self>, line: &str, sink: ReplySink) {
        let mut parts = line.splitn(2, ' ');
        let Some(verb) = parts.next() else { return };
        let rest = parts.next().unwrap_or("").trim();

        match verb {
            "HELLO" => {
                if let Ok(peer_id) = rest.parse::<i32>() {
                    if let ReplySink::ServerSlot(slot) = &sink {
                        self.slot_peer.lock().await.insert(*slot, peer_id);
                        info!("[{}] dstore HELLO mapped slot {slot} to node {peer_id}", self.self_id);
                    }
                    self.send_snapshot_slot(&sink).await;
                }
            }
            "KEEP_ALIVE" => {}
            "PUT" => {
                if let Some((key, value)) = rest.split_once('=') {
                    if let Err(e) = self.apply_local(key, value).await {
                        warn!("[{}] failed to apply replicated PUT: {e}", self.self_id);
                    }
                }
            }
            "FORWARD_PUT" => {
                if let Some((key, value)) = rest.split_once('=') {
                    if self.rale.is_leader().await {
                        if let Err(e) = self.handle_put(key, value).await {
                            warn!("[{}] failed to apply forwarded PUT: {e}", self.self_id);
                        }
                    }
                }
            }
            "DELETE" => {
                self.kv.delete(rest.as_bytes()).await;
            }
            "FORWARD_DELETE" => {
                if self.rale.is_leader().await {
                    if let Err(e) = self.handle_delete(rest).await {
                        warn!("[{}] failed to apply forwarded DELETE: {e}", self.self_id);
                    }
                }
            }
            "GET" => {
                let reply = match self.kv.get(rest.as_bytes()).await {
                    Some(v) => format!("VALUE {rest}={}", String::from_utf8_lossy(&v)),
                    None => format!("NOT_FOUND {rest}"),
                };
                self.reply(&sink, &reply).await;
            }
            "PROPAGATE_ADD" => {
                let mut p = rest.split_whitespace();
                if let (Some(id), Some(name), Some(ip), Some(rp), Some(dp)) =
                    (p.next(), p.next(), p.next(), p.next(), p.next())
                {
                    if let (Ok(id), Ok(rp), Ok(dp)) = (id.parse::<i32>(), rp.parse::<u16>(), dp.parse::<u16>()) {
                        if let Err(e) = self.registry.propagate_add(id, name, ip, rp, dp).await {
                            debug!("[{}] propagate_add({id}) failed: {e}", self.self_id);
                        }
                    }
                }
            }
            "PROPAGATE_REMOVE" => {
                if let Ok(id) = rest.parse::<i32>() {
                    let _ = self.registry.propagate_remove(id).await;
                }
            }
            "LEADER" => {
                let mut p = rest.split_whitespace();
                if let (Some(term), Some(leader_id)) = (p.next(), p.next()) {
                    if let (Ok(term), Ok(leader_id)) = (term.parse::<u32>(), leader_id.parse::<i32>()) {
                        self.rale.apply_leader_snapshot(term, leader_id).await;
                    }
                }
            }
            _ => debug!("[{}] ignoring unknown dstore message: {line}", self.self_id),
        }
    }

    async fn send_snapshot_slot(self: &Arc<Self>, sink: &ReplySink) {
        for node in self.registry.all().await {
            let msg = format!(
                "PROPAGATE_ADD {} {} {} {} {}",
                node.id, node.name, node.ip, node.rale_port, node.dstore_port
            );
            self.reply(sink, &msg).await;
        }
        let (term, leader_id) = self.rale.leader_cell.get();
        self.reply(sink, &format!("LEADER {term} {leader_id}")).await;
    }

    /// Propagate a freshly `ADD`ed node to every connected peer. Called
    /// by the control-socket handler after `registry.add` succeeds.
    pub async fn propagate_add(self: &Arc<Self>, id: i32, name: &str, ip: &str, rale_port: u16, dstore_port: u16) {
        self.broadcast_to_peers(&format!("PROPAGATE_ADD {id} {name} {ip} {rale_port} {dstore_port}"))
            .await;
    }

    pub async fn propagate_remove(self: &Arc<Self>, id: i32) {
        self.broadcast_to_peers(&format!("PROPAGATE_REMOVE {id}")).await;
    }

    pub async fn is_node_connected(&self, peer_id: i32, nodes: &[crate::node::NodeDescriptor]) -> bool {
        let Some(addr) = self.leader_addr(peer_id, nodes) else {
            return false;
        };
        self.clients
            .lock()
            .await
            .get(&addr)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rale::{RaleConfig, RaleNode};
    use crate::udp::UdpTransport;
    use std::time::Duration as StdDuration;

    async fn make_store(id: i32, registry: Arc<ClusterRegistry>) -> Arc<DStore> {
        let (udp, rx) = UdpTransport::bind(0).await.unwrap();
        drop(rx);
        let dir = tempfile::tempdir().unwrap();
        let rale = RaleNode::new(
            RaleConfig {
                self_id: id,
                heartbeat_interval: StdDuration::from_millis(50),
                election_timeout: StdDuration::from_millis(500),
            },
            dir.path(),
            Arc::clone(&registry),
            udp,
        )
        .await
        .unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let (store, events) = DStore::new(id, 0, dir2.path(), rale, registry, StdDuration::from_secs(5))
            .await
            .unwrap();
        drop(events);
        store
    }

    #[tokio::test]
    async fn leader_put_then_local_get() {
        let registry = Arc::new(ClusterRegistry::new());
        let store = make_store(1, registry).await;
        store.rale.apply_leader_snapshot(1, 1).await;
        store.handle_put("color", "blue").await.unwrap();
        assert_eq!(store.handle_get("color").await.unwrap(), b"blue");
    }

    #[tokio::test]
    async fn non_leader_put_without_known_leader_errors() {
        let registry = Arc::new(ClusterRegistry::new());
        let store = make_store(2, registry).await;
        let err = store.handle_put("k", "v").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn oversized_put_rejected() {
        let registry = Arc::new(ClusterRegistry::new());
        let store = make_store(1, registry).await;
        store.rale.apply_leader_snapshot(1, 1).await;
        let big = "a".repeat(MAX_VALUE_SIZE + 1);
        assert!(store.handle_put("k", &big).await.is_err());
    }

    #[tokio::test]
    async fn replicated_put_line_applies_locally() {
        let registry = Arc::new(ClusterRegistry::new());
        let store = make_store(2, registry).await;
        store.process_command("PUT size=large", ReplySink::None).await;
        assert_eq!(store.handle_get("size").await.unwrap(), b"large");
    }

    #[tokio::test]
    async fn is_node_connected_reflects_outbound_link_state() {
        let registry = Arc::new(ClusterRegistry::new());
        let store = make_store(1, Arc::clone(&registry)).await;
        let nodes = vec![crate::node::NodeDescriptor::new(
            2,
            "n2".to_string(),
            "127.0.0.1".to_string(),
            0,
            1,
        )];
        assert!(!store.is_node_connected(2, &nodes).await);
    }

    #[tokio::test]
    async fn propagate_add_then_list_includes_node() {
        let registry = Arc::new(ClusterRegistry::new());
        let store = make_store(1, registry.clone()).await;
        store
            .process_command("PROPAGATE_ADD 4 n4 127.0.0.1 5004 6004", ReplySink::None)
            .await;
        assert!(registry.get_by_id(4).await.is_some());
    }
}
