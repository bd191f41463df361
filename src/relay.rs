//! Relay fan-out: forwards every ingested signal to a configured ordered list
//! of downstream subspace servers, enabling chained propagation topologies.
//!
//! A write failure to any downstream is FATAL: the worker logs and terminates the process.
//! A more robust design would log and continue instead, but chained propagation in a trusted
//! topology should not silently conceal misconfiguration, so the fatal policy is kept.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::config::PORT_SEND;
use crate::error::TransportError;
use crate::stats::Counters;

struct Downstream {
    addr: SocketAddr,
    socket: UdpSocket,
}

/// Handle used by the ingress loop to publish an ingested signal onto the relay queue.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl RelayHandle {
    /// Publishes `data` for forwarding. Non-blocking: the queue is unbounded, so a slow
    /// downstream cannot stall the ingress loop (it can only grow process memory, which is
    /// the accepted trade-off of an unreliable, best-effort relay).
    pub fn publish(&self, data: Vec<u8>) {
        let _ = self.tx.send(data);
    }
}

/// Opens one UDP sender per downstream host (dialed to `host:PORT_SEND`) and spawns the
/// worker that drains the shared queue, forwarding every payload to every downstream in
/// order.
pub async fn spawn(hosts: Vec<String>, counters: Arc<Counters>) -> Result<RelayHandle, TransportError> {
    let mut downstreams = Vec::with_capacity(hosts.len());

    for host in hosts {
        let addr = resolve(&host, PORT_SEND).await?;
        let socket = dial(addr).await?;
        downstreams.push(Downstream { addr, socket });
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            for down in &downstreams {
                match down.socket.send(&payload).await {
                    Ok(written) => {
                        counters.fx.fetch_add(written as u64, std::sync::atomic::Ordering::Relaxed);
                    }
                    Err(source) => {
                        error!(
                            target: "relay",
                            addr = %down.addr,
                            %source,
                            "relay write failed, terminating"
                        );
                        std::process::exit(1);
                    }
                }
            }
        }

        trace!(target: "relay", "relay queue closed");
    });

    Ok(RelayHandle { tx })
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve { host: host.to_string(), source })?
        .next()
        .ok_or_else(|| TransportError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address found"),
        })
}

async fn dial(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let local: SocketAddr =
        if addr.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
    let socket =
        UdpSocket::bind(local).await.map_err(|source| TransportError::Bind { addr: local, source })?;
    socket.connect(addr).await.map_err(|source| TransportError::Connect { addr, source })?;
    Ok(socket)
}
