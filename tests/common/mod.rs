//! Shared multi-node test harness: spins up full RALE + DStore stacks on
//! real loopback listeners per node, for `#[tokio::test]` sleep-then-assert
//! convergence checks.

use raled::dstore::DStore;
use raled::rale::{RaleConfig, RaleNode};
use raled::registry::ClusterRegistry;
use raled::udp::UdpTransport;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub rale: Arc<RaleNode>,
    pub dstore: Arc<DStore>,
    pub registry: Arc<ClusterRegistry>,
    _dirs: (TempDir, TempDir),
}

/// Spin up `count` nodes on consecutive ports starting at `rale_port_base`
/// / `dstore_port_base`, each with the full cluster pre-loaded into its
/// registry, and start their background tasks.
pub async fn spin_cluster(count: i32, rale_port_base: u16, dstore_port_base: u16) -> Vec<Harness> {
    let mut harnesses = Vec::new();

    for i in 1..=count {
        let registry = Arc::new(ClusterRegistry::new());
        for j in 1..=count {
            registry
                .add(
                    j,
                    &format!("n{j}"),
                    "127.0.0.1",
                    rale_port_base + j as u16,
                    dstore_port_base + j as u16,
                )
                .await
                .unwrap();
        }
        registry.set_self(i).await.unwrap();

        let rale_dir = tempfile::tempdir().unwrap();
        let (udp, udp_events) = UdpTransport::bind(rale_port_base + i as u16).await.unwrap();
        let rale = RaleNode::new(
            RaleConfig {
                self_id: i,
                heartbeat_interval: Duration::from_millis(100),
                election_timeout: Duration::from_millis(400),
            },
            rale_dir.path(),
            Arc::clone(&registry),
            udp,
        )
        .await
        .unwrap();

        let dstore_dir = tempfile::tempdir().unwrap();
        let (dstore, dstore_events) = DStore::new(
            i,
            dstore_port_base + i as u16,
            dstore_dir.path(),
            Arc::clone(&rale),
            Arc::clone(&registry),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let (elected_tx, mut elected_rx) = tokio::sync::mpsc::unbounded_channel();
        rale.set_elected_sender(elected_tx).await;
        let elected_dstore = Arc::clone(&dstore);
        tokio::spawn(async move {
            while let Some((term, leader_id)) = elected_rx.recv().await {
                elected_dstore.on_leader_elected(term, leader_id).await;
            }
        });

        rale.start(udp_events);
        dstore.start(dstore_events);

        harnesses.push(Harness {
            rale,
            dstore,
            registry,
            _dirs: (rale_dir, dstore_dir),
        });
    }

    harnesses
}
