//! The paired send/receive UDP channel used by the `ss` CLI. The same shape is what an
//! external HTTP proxy collaborator would dial into, but that
//! collaborator is out of scope for this crate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::{MAX_BUFFER, PORT_SCAN, PORT_SEND};
use crate::error::TransportError;

/// A scan is considered finished after this much silence; every `scan()` call therefore takes
/// at least this long.
const SCAN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// A bidirectional client channel: one UDP socket dialed to `host:PORT_SEND` for [`send`],
/// one dialed to `host:PORT_SCAN` for [`scan`]. Both sockets close when the channel is dropped
/// — no explicit finalizer is needed.
///
/// [`send`]: Channel::send
/// [`scan`]: Channel::scan
pub struct Channel {
    send_socket: UdpSocket,
    scan_socket: UdpSocket,
    /// Total bytes written across both sockets.
    pub tx: AtomicU64,
    /// Total bytes read from the scan socket.
    pub rx: AtomicU64,
}

impl Channel {
    /// Dials both ports of `host`. A dial failure is fatal.
    pub async fn connect(host: &str) -> Result<Self, TransportError> {
        let send_addr = resolve(host, PORT_SEND).await?;
        let scan_addr = resolve(host, PORT_SCAN).await?;

        Ok(Self {
            send_socket: dial(send_addr).await?,
            scan_socket: dial(scan_addr).await?,
            tx: AtomicU64::new(0),
            rx: AtomicU64::new(0),
        })
    }

    /// Sends `data` as a single signal. A write failure is fatal.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let addr = self.send_socket.peer_addr().expect("connected socket");
        let n = self
            .send_socket
            .send(data)
            .await
            .map_err(|source| TransportError::Write { addr, source })?;
        self.tx.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Sends `state_key`, then relays every signal received to `sink` until a one-second idle
    /// timeout closes it. A write failure or non-timeout read failure is fatal.
    pub async fn scan(&self, state_key: &[u8], sink: mpsc::Sender<Vec<u8>>) -> Result<(), TransportError> {
        let addr = self.scan_socket.peer_addr().expect("connected socket");
        let n = self
            .scan_socket
            .send(state_key)
            .await
            .map_err(|source| TransportError::Write { addr, source })?;
        self.tx.fetch_add(n as u64, Ordering::Relaxed);

        let mut buf = vec![0u8; MAX_BUFFER];

        loop {
            match tokio::time::timeout(SCAN_IDLE_TIMEOUT, self.scan_socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    self.rx.fetch_add(n as u64, Ordering::Relaxed);
                    if sink.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(Err(source)) => return Err(TransportError::Write { addr, source }),
                Err(_elapsed) => {
                    trace!(target: "client", "scan idle timeout, closing");
                    break;
                }
            }
        }

        Ok(())
    }
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
