//! `ss`: a stream CLI for subspace server communication.
//!
//! Signal bytes on stdin (1..=1024) are sent to `relay:8211` as one datagram. With no stdin,
//! the process scans `relay:8212` using the host's first active MAC address as the state key
//! and prints each received signal to stdout, followed by a line break, until idle for one
//! second.
//!
//!     stdin | ss [relay] > stdout

use std::io::{IsTerminal, Read, Write};

use subspace::client::Channel;
use subspace::config::MAX_BUFFER;

#[tokio::main]
async fn main() {
    init_tracing();

    let host = std::env::args().nth(1).unwrap_or_else(|| "localhost".to_string());

    let channel = match Channel::connect(&host).await {
        Ok(channel) => channel,
        Err(err) => fatal(&err.to_string()),
    };

    let input = read_stdin();

    if input.len() > MAX_BUFFER {
        eprintln!("⇌ [buffer overflow]");
        std::process::exit(1);
    }

    if !input.is_empty() {
        if let Err(err) = channel.send(&input).await {
            fatal(&err.to_string());
        }
        return;
    }

    let key = mac_address_key().unwrap_or_else(|| fatal("no address"));
    let (tx, mut rx) = tokio::sync::mpsc::channel(32);

    let scan = tokio::spawn(async move {
        if let Err(err) = channel.scan(&key, tx).await {
            eprintln!("⇌ {err}");
            std::process::exit(1);
        }
    });

    let mut stdout = std::io::stdout().lock();
    while let Some(signal) = rx.recv().await {
        let _ = stdout.write_all(&signal);
        let _ = stdout.write_all(b"\n");
    }

    let _ = scan.await;
}

/// Reads all of stdin, unless stdin is a terminal (no piped input).
fn read_stdin() -> Vec<u8> {
    if std::io::stdin().is_terminal() {
        return Vec::new();
    }

    let mut buf = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut buf);
    buf
}

/// The host's first active MAC address, used as the default scan state key.
fn mac_address_key() -> Option<Vec<u8>> {
    mac_address::get_mac_address().ok().flatten().map(|mac| mac.bytes().to_vec())
}

fn fatal(msg: &str) -> ! {
    eprintln!("⇌ {msg}");
    std::process::exit(1);
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
