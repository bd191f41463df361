//! `subspace`: an in-memory, time-ordered signal bus server.
//!
//! Usage: `subspace [relay...]`. Opens ingress/egress UDP ports 8211/8212, a stats TCP reader
//! on 8081, and a once-per-second GC ticker. Reads `SUBSPACE_RETENTION` (seconds, default
//! 3600) from the environment; exits on SIGINT or SIGTERM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use subspace::config::SubspaceArgs;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = SubspaceArgs::parse().into_config();
    config.banner();

    let (_space, mut handle) = match subspace::spawn(config).await {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("⇌ {err}");
            std::process::exit(1);
        }
    };

    wait_for_termination().await;

    handle.shutdown();
    handle.join().await;

    subspace::config::SubspaceConfig::farewell();
}

/// Resolves once a SIGINT or SIGTERM is received. A second signal while waiting is ignored.
async fn wait_for_termination() {
    let received = Arc::new(AtomicBool::new(false));
    let (tx, rx) = std::sync::mpsc::channel();

    {
        let received = received.clone();
        ctrlc::set_handler(move || {
            if !received.swap(true, Ordering::SeqCst) {
                let _ = tx.send(());
            }
        })
        .expect("failed to install signal handler");
    }

    let _ = tokio::task::spawn_blocking(move || rx.recv()).await;
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;

    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
