//! `subspace`: an in-memory, time-ordered signal bus reachable over an unreliable datagram
//! transport.
//!
//! The core is the concurrent, circular, pooled [`space::Space`]; everything
//! else in this crate is the datagram dispatch layer wrapped around it: the ingress/egress UDP
//! endpoints (`net`), the best-effort relay fan-out (`relay`), the GC ticker and stats reader
//! (`stats`), and the client channel used by the `ss` CLI (`client`). The `subspace` and `ss`
//! binaries in `src/bin` wire these together.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod net;
pub mod relay;
pub mod shutdown;
pub mod space;
pub mod stats;
pub mod task_manager;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::info;

use config::{SubspaceConfig, PORT_SCAN, PORT_SEND, PORT_STATS};
use error::TransportError;
use shutdown::{signal, Signal};
use space::Space;
use stats::Counters;
use task_manager::TaskManager;

/// Spawns a fully wired subspace server: the ingress/egress UDP endpoints, the optional relay
/// fan-out, the GC ticker and the stats TCP reader.
///
/// Returns the shared [`Space`] — so an embedder may `send`/`scan` in-process alongside the
/// datagram endpoints — and a [`ServerHandle`] used to request shutdown and await completion.
pub async fn spawn(config: SubspaceConfig) -> Result<(Arc<Space>, ServerHandle), TransportError> {
    let space = Space::new().await;
    let counters = Arc::new(Counters::default());

    let (shutdown_signal, shutdown) = signal();
    let tasks = TaskManager::new(tokio::runtime::Handle::current());

    let relay = if config.relays.is_empty() {
        None
    } else {
        info!(target: "subspace", relays = ?config.relays, "starting relay fan-out");
        Some(relay::spawn(config.relays.clone(), counters.clone()).await?)
    };

    let ingress_socket =
        net::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PORT_SEND)).await?;
    let egress_socket =
        net::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PORT_SCAN)).await?;

    let ingress = {
        let (space, shutdown, counters) = (space.clone(), shutdown.clone(), counters.clone());
        let workers = config.workers;
        tasks.spawn(async move {
            net::ingress(ingress_socket, space, relay, counters, workers, shutdown).await
        })
    };

    let egress = {
        let (space, shutdown, counters) = (space.clone(), shutdown.clone(), counters.clone());
        let workers = config.workers;
        tasks.spawn(async move {
            net::egress(egress_socket, space, counters, workers, shutdown).await
        })
    };

    let gc = {
        let (space, shutdown, counters) = (space.clone(), shutdown.clone(), counters.clone());
        let retention_ms = config.retention_ms;
        tasks.spawn(async move { stats::run_gc(space, counters, retention_ms, shutdown).await })
    };

    let stats_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PORT_STATS);
    let stats_server = tasks.spawn(async move {
        let _ = stats::run_stats_server(stats_addr, shutdown).await;
    });

    Ok((
        space,
        ServerHandle { shutdown_signal: Some(shutdown_signal), tasks: vec![ingress, egress, gc, stats_server] },
    ))
}

/// Handle to a running server's background tasks.
///
/// Calling [`ServerHandle::shutdown`] fires the shutdown signal observed cooperatively by
/// every task; [`ServerHandle::join`] waits for them all to stop. Termination
/// abandons any pending work without a graceful drain — tasks simply observe the signal at
/// their next loop iteration.
pub struct ServerHandle {
    shutdown_signal: Option<Signal>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Fires the shutdown signal. Idempotent: a second call is a no-op.
    pub fn shutdown(&mut self) {
        if let Some(signal) = self.shutdown_signal.take() {
            let _ = signal.fire();
        }
    }

    /// Waits for every background task to stop.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
