//! Runtime configuration for the `subspace` server.

use yansi::Paint;

/// Maximum size of a single signal, and the UDP receive buffer size.
pub const MAX_BUFFER: usize = 1024;

/// Incoming signal port (`Send`).
pub const PORT_SEND: u16 = 8211;

/// Outgoing signal port (`Scan`).
pub const PORT_SCAN: u16 = 8212;

/// Stats TCP server port.
pub const PORT_STATS: u16 = 8081;

/// Path the GC ticker writes its JSON stats snapshot to, read back by the stats server.
pub const STATS_PATH: &str = "/tmp/subspace";

const DEFAULT_RETENTION_SECS: i64 = 3600;

fn default_workers() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1)
}

/// CLI arguments for the `subspace` server binary.
#[derive(Debug, Clone, clap::Parser)]
#[clap(name = "subspace", about = "An in-memory, time-ordered signal bus")]
pub struct SubspaceArgs {
    /// Relay hosts to forward every received signal to, in order.
    pub relays: Vec<String>,

    /// Signal retention window, in seconds. Zero or negative disables garbage collection.
    #[clap(long, env = "SUBSPACE_RETENTION", default_value_t = DEFAULT_RETENTION_SECS)]
    pub retention: i64,

    /// Suppress the startup banner.
    #[clap(long)]
    pub silent: bool,

    /// Number of datagrams handled concurrently per endpoint.
    #[clap(long, default_value_t = default_workers())]
    pub workers: usize,
}

impl SubspaceArgs {
    pub fn into_config(self) -> SubspaceConfig {
        SubspaceConfig {
            relays: self.relays,
            retention_ms: self.retention.saturating_mul(1000),
            silent: self.silent,
            workers: self.workers.max(1),
        }
    }
}

/// The resolved, ready-to-run configuration.
#[derive(Debug, Clone)]
pub struct SubspaceConfig {
    pub relays: Vec<String>,
    pub retention_ms: i64,
    pub silent: bool,
    pub workers: usize,
}

impl SubspaceConfig {
    /// Prints the startup banner, unless `--silent` was given.
    pub fn banner(&self) {
        if self.silent {
            return;
        }

        let relays =
            if self.relays.is_empty() { String::new() } else { format!(" -> {}", self.relays.join(", ")) };

        println!("{} [{}s]{}", Paint::cyan("⇌ Subspace").bold(), self.retention_ms / 1000, relays);
    }

    /// Prints the shutdown banner.
    pub fn farewell() {
        println!("{}", Paint::cyan("⇌ Subspace lost"));
    }
}
