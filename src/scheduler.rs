//! Process supervisor: spawns the RALE, DStore, and control-socket
//! subsystems and coordinates shutdown across them.
//!
//! The subsystems are spawned as sibling tasks and joined at shutdown.
//! A prior implementation of this supervisor polled a shutdown flag on a
//! timer; here a `tokio::sync::watch` channel plays the same role
//! without the busy-wait, and without the lost-wakeup risk a plain
//! `Notify` would have if `STOP` arrives before the supervisor starts
//! waiting.

use crate::control::ControlServer;
use crate::dstore::DStore;
use crate::rale::RaleNode;
use log::info;
use std::sync::Arc;
use tokio::sync::watch;

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    complete_tx: watch::Sender<bool>,
    complete_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            complete_tx,
            complete_rx,
        }
    }

    /// Request shutdown, e.g. from a signal handler in `bin/raled.rs`.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A clonable handle the control socket's `STOP` command can hold to
    /// request shutdown without depending on the full `Scheduler`.
    pub fn shutdown_trigger(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Start every subsystem's background tasks and block until shutdown
    /// is requested.
    pub async fn run(
        &self,
        rale: Arc<RaleNode>,
        dstore: Arc<DStore>,
        control: Arc<ControlServer>,
        control_socket_path: String,
        dstore_events: tokio::sync::mpsc::UnboundedReceiver<crate::tcp::ServerEvent>,
        udp_events: tokio::sync::mpsc::UnboundedReceiver<(std::net::SocketAddr, String)>,
    ) {
        rale.start(udp_events);
        dstore.start(dstore_events);

        let control_task = tokio::spawn(async move {
            if let Err(e) = control.serve(&control_socket_path).await {
                log::error!("control socket exited: {e}");
            }
        });

        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        info!("shutdown requested, stopping subsystems");
        control_task.abort();

        self.signal_shutdown_complete();
    }

    fn signal_shutdown_complete(&self) {
        let _ = self.complete_tx.send(true);
    }

    /// Block until `signal_shutdown_complete` has fired, including when it
    /// already fired before this call.
    pub async fn wait_for_shutdown_completion(&self) {
        let mut rx = self.complete_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}
