//! `raled`: the RALE/DStore daemon entry point.
//!
//! Loads config (file + CLI overrides), initializes logging, brings up
//! the RALE and DStore subsystems, and runs the control-socket and
//! scheduler loop until shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use raled::config::Config;
use raled::dstore::DStore;
use raled::node::NAME_MAX;
use raled::rale::{RaleConfig, RaleNode};
use raled::registry::ClusterRegistry;
use raled::scheduler::Scheduler;
use raled::udp::UdpTransport;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(version, about = "RALE/DStore replicated key-value daemon", long_about = None)]
struct Cli {
    /// Path to the `raled.conf` key=value configuration file.
    #[arg(long, default_value = "raled.conf")]
    config: String,

    /// Override the configured node id.
    #[arg(long)]
    node_id: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    if let Some(id) = cli.node_id {
        config.node_id = id;
    }
    if config.node_name.len() > NAME_MAX {
        anyhow::bail!("node_name exceeds {NAME_MAX} characters");
    }

    info!(
        "starting raled: node_id={} name={} rale_port={} dstore_port={}",
        config.node_id, config.node_name, config.rale_port, config.dstore_port
    );

    std::fs::create_dir_all(&config.db_path)
        .with_context(|| format!("creating db.path directory {}", config.db_path))?;

    let registry = Arc::new(ClusterRegistry::new());
    let cluster_state_path = std::path::Path::new(&config.db_path).join("cluster.state");
    registry.load(&cluster_state_path).await?;
    registry.set_self(config.node_id).await?;
    if registry.get_by_id(config.node_id).await.is_none() {
        registry
            .add(
                config.node_id,
                &config.node_name,
                &config.node_ip,
                config.rale_port,
                config.dstore_port,
            )
            .await?;
    }
    registry.set_priority(config.node_id, config.node_priority).await?;
    for peer in &config.peers {
        if registry.get_by_id(peer.id).await.is_none() {
            registry
                .add(peer.id, &peer.name, &peer.ip, peer.rale_port, peer.dstore_port)
                .await?;
        }
    }

    let (udp, udp_events) = UdpTransport::bind(config.rale_port)
        .await
        .context("binding RALE UDP socket")?;
    let rale = RaleNode::new(
        RaleConfig {
            self_id: config.node_id,
            heartbeat_interval: Duration::from_secs(config.dstore_keep_alive_interval),
            election_timeout: Duration::from_secs(config.dstore_keep_alive_timeout),
        },
        &config.db_path,
        Arc::clone(&registry),
        udp,
    )
    .await
    .context("initializing RALE node")?;

    let (dstore, dstore_events) = DStore::new(
        config.node_id,
        config.dstore_port,
        &config.db_path,
        Arc::clone(&rale),
        Arc::clone(&registry),
        Duration::from_secs(config.dstore_keep_alive_interval),
    )
    .await
    .context("initializing DStore")?;

    let (elected_tx, mut elected_rx) = tokio::sync::mpsc::unbounded_channel();
    rale.set_elected_sender(elected_tx).await;
    let elected_dstore = Arc::clone(&dstore);
    tokio::spawn(async move {
        while let Some((term, leader_id)) = elected_rx.recv().await {
            elected_dstore.on_leader_elected(term, leader_id).await;
        }
    });

    let scheduler = Scheduler::new();
    let control = raled::control::ControlServer::new(
        Arc::clone(&rale),
        Arc::clone(&dstore),
        Arc::clone(&registry),
        scheduler.shutdown_trigger(),
    );

    let scheduler = Arc::new(scheduler);
    let sig_scheduler = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, requesting shutdown");
            sig_scheduler.request_shutdown();
        }
    });

    scheduler
        .run(
            rale,
            dstore,
            control,
            config.control_socket_path.clone(),
            dstore_events,
            udp_events,
        )
        .await;
    scheduler.wait_for_shutdown_completion().await;

    info!("raled shutdown complete");
    Ok(())
}
