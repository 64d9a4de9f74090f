//! Unix-domain control socket: the operator-facing command interface
//! (`STATUS`, `LIST`, `ADD`, `REMOVE`, `STOP`, `PUT`, `GET`), accepting
//! both a plain-text tokenized form and a JSON `{"command":...}` form.
//!
//! A JSON-first, tokenized-fallback dispatch is a natural fit for an
//! operator socket that predates a strict wire format; this keeps that
//! same two-path dispatch, expressed as one `process_line` entry point
//! shared by both. Every response, regardless of request form, is the
//! `{status_code, message, data}` JSON envelope spec.md §7 describes.

use crate::dstore::DStore;
use crate::error::RaleError;
use crate::node::NodeState;
use crate::rale::{RaleNode, Role};
use crate::registry::ClusterRegistry;
use log::{debug, info};
use serde::Serialize;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::watch;

pub const MAX_KEY_LENGTH: usize = 256;
pub const MAX_VALUE_LENGTH: usize = 1024;

/// The JSON response envelope every control-socket command returns,
/// grounded in `original_source/raled/src/raled_response.c`.
#[derive(Serialize)]
struct ControlResponse {
    status_code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl ControlResponse {
    fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self { status_code: 200, message: message.into(), data }
    }

    fn client_error(message: impl Into<String>) -> Self {
        Self { status_code: 400, message: message.into(), data: None }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self { status_code: 404, message: message.into(), data: None }
    }

    fn from_rale_error(e: &RaleError) -> Self {
        let status_code = if e.is_config_error() || e.is_consensus_error() {
            503
        } else {
            match e {
                RaleError::Validation(_) => 400,
                RaleError::Resource(_) => 409,
                _ => 500,
            }
        };
        Self { status_code, message: e.to_string(), data: None }
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status_code":500,"message":"failed to serialize response"}"#.to_string()
        })
    }
}

pub struct ControlServer {
    rale: Arc<RaleNode>,
    dstore: Arc<DStore>,
    registry: Arc<ClusterRegistry>,
    shutdown: watch::Sender<bool>,
}

impl ControlServer {
    pub fn new(
        rale: Arc<RaleNode>,
        dstore: Arc<DStore>,
        registry: Arc<ClusterRegistry>,
        shutdown: watch::Sender<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rale,
            dstore,
            registry,
            shutdown,
        })
    }

    /// Bind the control socket, removing a stale file left behind by a
    /// prior run (the original daemon does the same `unlink` before
    /// `bind` in `raled_main.c`), then open it up to 0666 permissions
    /// matching `LIBRALE_SOCKET_PERMISSIONS`.
    pub async fn serve(self: &Arc<Self>, socket_path: &str) -> std::io::Result<()> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
        info!("control socket listening at {socket_path}");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let server = Arc::clone(self);
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end_matches(['\n', '\r']);
                            let response = server.process_line(trimmed).await;
                            if write_half.write_all(response.as_bytes()).await.is_err()
                                || write_half.write_all(b"\n").await.is_err()
                            {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    }

    async fn process_line(self: &Arc<Self>, command_text: &str) -> String {
        if command_text.is_empty() {
            return ControlResponse::client_error("empty command").to_line();
        }
        debug!("processing control command: \"{command_text}\"");

        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(command_text) {
            if let Some(Value::String(cmd)) = obj.get("command") {
                match cmd.as_str() {
                    "GET" => {
                        return match obj.get("key") {
                            Some(Value::String(key)) => self.cmd_get(key).await,
                            _ => ControlResponse::client_error("GET requires a \"key\" field").to_line(),
                        };
                    }
                    "PUT" => {
                        return match (obj.get("key"), obj.get("value")) {
                            (Some(Value::String(key)), Some(Value::String(value))) => {
                                self.cmd_put(key, value).await
                            }
                            _ => ControlResponse::client_error(
                                "PUT requires \"key\" and \"value\" fields",
                            )
                            .to_line(),
                        };
                    }
                    "STATUS" => return self.cmd_status().await,
                    "LIST" => return self.cmd_list().await,
                    "STOP" => return self.cmd_stop(),
                    _ => {}
                }
            }
        }

        let mut tokens = command_text.split_whitespace();
        let Some(verb) = tokens.next() else {
            return ControlResponse::client_error("invalid command format").to_line();
        };
        let verb = verb.to_uppercase();

        match verb.as_str() {
            "GET" => match tokens.next() {
                Some(key) => self.cmd_get(key).await,
                None => ControlResponse::client_error("GET requires a key").to_line(),
            },
            "PUT" => {
                let key = tokens.next();
                match key {
                    Some(key) => {
                        let value = command_text
                            .splitn(3, char::is_whitespace)
                            .nth(2)
                            .map(str::trim_start)
                            .unwrap_or("");
                        if value.is_empty() {
                            ControlResponse::client_error("PUT requires key and value").to_line()
                        } else {
                            self.cmd_put(key, value).await
                        }
                    }
                    None => ControlResponse::client_error("PUT requires key and value").to_line(),
                }
            }
            "LIST" => self.cmd_list().await,
            "STATUS" => self.cmd_status().await,
            "STOP" => self.cmd_stop(),
            "ADD" => {
                let parts: Vec<&str> = tokens.collect();
                if parts.len() != 5 {
                    return ControlResponse::client_error(
                        "ADD requires node_id name ip rale_port dstore_port",
                    )
                    .to_line();
                }
                self.cmd_add(parts[0], parts[1], parts[2], parts[3], parts[4]).await
            }
            "REMOVE" => match tokens.next() {
                Some(id) => self.cmd_remove(id).await,
                None => ControlResponse::client_error("REMOVE requires node_id").to_line(),
            },
            other => ControlResponse::client_error(format!("unknown command '{other}'")).to_line(),
        }
    }

    async fn cmd_get(&self, key: &str) -> String {
        if key.len() > MAX_KEY_LENGTH {
            return ControlResponse::client_error("key too long").to_line();
        }
        match self.dstore.handle_get(key).await {
            Some(value) => {
                let value = String::from_utf8_lossy(&value).to_string();
                ControlResponse::ok("OK", Some(json!({ "key": key, "value": value }))).to_line()
            }
            None => ControlResponse::not_found("key not found").to_line(),
        }
    }

    async fn cmd_put(self: &Arc<Self>, key: &str, value: &str) -> String {
        if key.len() > MAX_KEY_LENGTH {
            return ControlResponse::client_error("key too long").to_line();
        }
        if value.len() > MAX_VALUE_LENGTH {
            return ControlResponse::client_error("value too long").to_line();
        }
        match self.dstore.handle_put(key, value).await {
            Ok(()) => ControlResponse::ok("OK", Some(json!({ "key": key, "value": value }))).to_line(),
            Err(e) => ControlResponse::from_rale_error(&e).to_line(),
        }
    }

    async fn cmd_list(&self) -> String {
        let nodes = self.registry.all().await;
        let role = self.rale.role().await;
        let self_id = self.registry.get_self().await;
        let entries: Vec<Value> = nodes
            .iter()
            .map(|n| {
                let role_str = if n.id == self_id {
                    role_str(role)
                } else {
                    node_state_str(n.state)
                };
                json!({
                    "id": n.id,
                    "name": n.name,
                    "ip": n.ip,
                    "rale_port": n.rale_port,
                    "dstore_port": n.dstore_port,
                    "priority": n.priority,
                    "role": role_str,
                })
            })
            .collect();
        ControlResponse::ok("OK", Some(json!({ "nodes": entries }))).to_line()
    }

    async fn cmd_status(&self) -> String {
        let (role, term, leader_id, voted_for, last_heartbeat, election_deadline) =
            self.rale.status().await;
        let self_id = self.registry.get_self().await;
        let node_count = self.registry.count().await;
        let priority = self
            .registry
            .get_by_id(self_id)
            .await
            .map(|n| n.priority)
            .unwrap_or(0);
        ControlResponse::ok(
            "OK",
            Some(json!({
                "node_id": self_id,
                "role": role_str(role),
                "term": term,
                "leader_id": leader_id,
                "voted_for": voted_for,
                "cluster_size": node_count,
                "priority": priority,
                "last_heartbeat_ms_ago": last_heartbeat.elapsed().as_millis() as u64,
                "election_deadline_ms": election_deadline.saturating_duration_since(std::time::Instant::now()).as_millis() as u64,
            })),
        )
        .to_line()
    }

    fn cmd_stop(self: &Arc<Self>) -> String {
        info!("STOP command received, signaling shutdown");
        let _ = self.shutdown.send(true);
        ControlResponse::ok("stop command received", None).to_line()
    }

    async fn cmd_add(&self, id: &str, name: &str, ip: &str, rale_port: &str, dstore_port: &str) -> String {
        let (Ok(id), Ok(rale_port), Ok(dstore_port)) =
            (id.parse::<i32>(), rale_port.parse::<u16>(), dstore_port.parse::<u16>())
        else {
            return ControlResponse::client_error("invalid ADD arguments").to_line();
        };
        match self.registry.add(id, name, ip, rale_port, dstore_port).await {
            Ok(()) => {
                self.dstore.propagate_add(id, name, ip, rale_port, dstore_port).await;
                ControlResponse::ok(format!("node {id} added"), Some(json!({ "id": id }))).to_line()
            }
            Err(e) => ControlResponse::from_rale_error(&e).to_line(),
        }
    }

    async fn cmd_remove(&self, id: &str) -> String {
        let Ok(id) = id.parse::<i32>() else {
            return ControlResponse::client_error("invalid node_id").to_line();
        };
        match self.registry.remove(id).await {
            Ok(()) => {
                self.dstore.propagate_remove(id).await;
                ControlResponse::ok(format!("node {id} removed"), Some(json!({ "id": id }))).to_line()
            }
            Err(e) => ControlResponse::from_rale_error(&e).to_line(),
        }
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::Follower => "follower",
        Role::Candidate => "candidate",
        Role::Leader => "leader",
        Role::Transitioning => "transitioning",
    }
}

fn node_state_str(state: NodeState) -> &'static str {
    match state {
        NodeState::Leader => "leader",
        NodeState::Candidate => "candidate",
        NodeState::Offline => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rale::RaleConfig;
    use crate::udp::UdpTransport;
    use std::time::Duration;

    async fn make_server() -> Arc<ControlServer> {
        let registry = Arc::new(ClusterRegistry::new());
        registry.add(1, "n1", "127.0.0.1", 5001, 6001).await.unwrap();
        registry.set_self(1).await.unwrap();

        let (udp, rx) = UdpTransport::bind(0).await.unwrap();
        drop(rx);
        let dir = tempfile::tempdir().unwrap();
        let rale = RaleNode::new(
            RaleConfig {
                self_id: 1,
                heartbeat_interval: Duration::from_millis(50),
                election_timeout: Duration::from_millis(500),
            },
            dir.path(),
            Arc::clone(&registry),
            udp,
        )
        .await
        .unwrap();
        rale.apply_leader_snapshot(1, 1).await;

        let dir2 = tempfile::tempdir().unwrap();
        let (dstore, events) = DStore::new(1, 0, dir2.path(), Arc::clone(&rale), Arc::clone(&registry), Duration::from_secs(5))
            .await
            .unwrap();
        drop(events);

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        ControlServer::new(rale, dstore, registry, shutdown_tx)
    }

    fn parse(resp: &str) -> Value {
        serde_json::from_str(resp).expect("response must be valid JSON")
    }

    #[tokio::test]
    async fn text_put_then_get_round_trips() {
        let server = make_server().await;
        let put = parse(&server.process_line("PUT color blue").await);
        assert_eq!(put["status_code"], 200);
        let get = parse(&server.process_line("GET color").await);
        assert_eq!(get["status_code"], 200);
        assert_eq!(get["data"]["value"], "blue");
    }

    #[tokio::test]
    async fn json_put_then_get_round_trips() {
        let server = make_server().await;
        let put = parse(&server.process_line(r#"{"command":"PUT","key":"size","value":"large"}"#).await);
        assert_eq!(put["status_code"], 200);
        let get = parse(&server.process_line(r#"{"command":"GET","key":"size"}"#).await);
        assert_eq!(get["data"]["value"], "large");
    }

    #[tokio::test]
    async fn get_missing_key_is_404() {
        let server = make_server().await;
        let resp = parse(&server.process_line("GET missing").await);
        assert_eq!(resp["status_code"], 404);
    }

    #[tokio::test]
    async fn status_reports_role_and_term() {
        let server = make_server().await;
        let resp = parse(&server.process_line("STATUS").await);
        assert_eq!(resp["status_code"], 200);
        assert_eq!(resp["data"]["role"], "leader");
        assert_eq!(resp["data"]["node_id"], 1);
    }

    #[tokio::test]
    async fn add_then_list_includes_new_node() {
        let server = make_server().await;
        let resp = parse(&server.process_line("ADD 2 n2 127.0.0.1 5002 6002").await);
        assert_eq!(resp["status_code"], 200);
        let list = parse(&server.process_line("LIST").await);
        let nodes = list["data"]["nodes"].as_array().unwrap();
        assert!(nodes.iter().any(|n| n["id"] == 2));
    }

    #[tokio::test]
    async fn remove_unknown_node_is_client_error() {
        let server = make_server().await;
        let resp = parse(&server.process_line("REMOVE 99").await);
        assert_eq!(resp["status_code"], 400);
    }

    #[tokio::test]
    async fn unknown_command_is_400() {
        let server = make_server().await;
        let resp = parse(&server.process_line("FROBNICATE").await);
        assert_eq!(resp["status_code"], 400);
    }

    #[tokio::test]
    async fn stop_signals_shutdown_watcher() {
        let registry = Arc::new(ClusterRegistry::new());
        registry.set_self(1).await.unwrap();
        let (udp, rx) = UdpTransport::bind(0).await.unwrap();
        drop(rx);
        let dir = tempfile::tempdir().unwrap();
        let rale = RaleNode::new(
            RaleConfig {
                self_id: 1,
                heartbeat_interval: Duration::from_millis(50),
                election_timeout: Duration::from_millis(500),
            },
            dir.path(),
            Arc::clone(&registry),
            udp,
        )
        .await
        .unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let (dstore, events) = DStore::new(1, 0, dir2.path(), Arc::clone(&rale), Arc::clone(&registry), Duration::from_secs(5))
            .await
            .unwrap();
        drop(events);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = ControlServer::new(rale, dstore, registry, shutdown_tx);

        let resp = parse(&server.process_line("STOP").await);
        assert_eq!(resp["status_code"], 200);
        assert!(*shutdown_rx.borrow_and_update());
    }
}
