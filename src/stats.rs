//! The GC ticker and the stats TCP reader.
//!
//! [`Counters`] holds the traffic byte counts shared across the ingress/egress endpoints and
//! the relay worker; [`run_gc`] samples them once a second alongside the space's own
//! live-count/live-bytes counters, serializes a snapshot and overwrites [`STATS_PATH`];
//! [`run_stats_server`] serves that file's current contents over a trivial per-connection TCP
//! accept loop, caching by modification time the way the original `tools/stats` reader does.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::config::STATS_PATH;
use crate::shutdown::Shutdown;
use crate::space::Space;

/// Byte counters shared across the ingress/egress endpoints and the relay worker.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub fx: AtomicU64,
}

/// The JSON snapshot written to [`STATS_PATH`] once a second.
#[derive(Debug, Serialize)]
struct Snapshot {
    #[serde(rename = "Num")]
    num: u64,
    #[serde(rename = "Mem")]
    mem: u64,
    #[serde(rename = "Rx")]
    rx: u64,
    #[serde(rename = "Tx")]
    tx: u64,
    #[serde(rename = "Fx")]
    fx: u64,
}

/// Runs the once-per-second tick: drops expired signals when `retention_ms` is positive
/// then overwrites the stats file with a fresh snapshot. Serialization
/// failures are swallowed — the snapshot for that tick is skipped.
pub async fn run_gc(space: Arc<Space>, counters: Arc<Counters>, retention_ms: i64, shutdown: Shutdown) {
    run_gc_at(space, counters, retention_ms, PathBuf::from(STATS_PATH), shutdown).await
}

async fn run_gc_at(
    space: Arc<Space>,
    counters: Arc<Counters>,
    retention_ms: i64,
    path: PathBuf,
    mut shutdown: Shutdown,
) {
    let mut file = match tokio::fs::OpenOptions::new().create(true).write(true).truncate(false).open(&path).await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(target: "gc", %err, path = %path.display(), "failed to open stats file, GC ticker disabled");
            return;
        }
    };

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        if retention_ms > 0 {
            space.drop_expired(retention_ms);
        }

        let snapshot = Snapshot {
            num: space.count(),
            mem: space.alloc(),
            rx: counters.rx.load(Ordering::Relaxed),
            tx: counters.tx.load(Ordering::Relaxed),
            fx: counters.fx.load(Ordering::Relaxed),
        };

        match serde_json::to_vec(&snapshot) {
            Ok(json) => {
                if let Err(err) = write_snapshot(&mut file, &json).await {
                    warn!(target: "gc", %err, "failed to write stats snapshot");
                }
            }
            Err(err) => warn!(target: "gc", %err, "failed to serialize stats snapshot"),
        }
    }

    trace!(target: "gc", "gc ticker stopped");
}

async fn write_snapshot(file: &mut tokio::fs::File, json: &[u8]) -> std::io::Result<()> {
    file.set_len(0).await?;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    file.write_all(json).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Cached stats-file contents, refreshed only when the file's modification time advances.
struct Cache {
    path: PathBuf,
    modified: Option<SystemTime>,
    data: Vec<u8>,
}

impl Cache {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), modified: None, data: Vec::new() }
    }

    async fn sync(&mut self) -> std::io::Result<&[u8]> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        let modified = metadata.modified()?;

        let stale = match self.modified {
            Some(cached) => modified > cached,
            None => true,
        };

        if stale {
            self.modified = Some(modified);
            self.data = tokio::fs::read(&self.path).await?;
        }

        Ok(&self.data)
    }
}

/// Runs the stats TCP accept loop on `addr` until `shutdown` fires. Each accepted connection
/// receives the current stats-file contents and is then closed.
pub async fn run_stats_server(addr: SocketAddr, shutdown: Shutdown) -> std::io::Result<()> {
    run_stats_server_at(addr, PathBuf::from(STATS_PATH), shutdown).await
}

async fn run_stats_server_at(addr: SocketAddr, path: PathBuf, mut shutdown: Shutdown) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let cache = Arc::new(Mutex::new(Cache::new(path)));

    loop {
        let (socket, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(target: "stats::server", %err, "accept failed");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let cache = cache.clone();
        tokio::spawn(async move {
            serve_one(socket, peer, cache).await;
        });
    }

    trace!(target: "stats::server", "stats server stopped");
    Ok(())
}

async fn serve_one(mut socket: TcpStream, peer: SocketAddr, cache: Arc<Mutex<Cache>>) {
    let mut cache = cache.lock().await;
    match cache.sync().await {
        Ok(data) => {
            if let Err(err) = socket.write_all(data).await {
                warn!(target: "stats::server", %peer, %err, "write failed");
            }
        }
        Err(err) => warn!(target: "stats::server", %peer, %err, "failed to read stats file"),
    }
}
