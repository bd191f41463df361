//! The two UDP datagram endpoints: ingress reads a signal and hands it to
//! [`Space::send`](crate::space::Space::send); egress reads a state key and streams
//! [`Space::scan`](crate::space::Space::scan)'s reply back to the requester.
//!
//! Both loops read at most one datagram per iteration and dispatch the resulting work through
//! a `workers`-permit [`Semaphore`], bounding the number of concurrently in-flight `send`/`scan`
//! tasks, bounding the number of concurrently in-flight datagram handlers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};
use tracing::{trace, warn};

use crate::config::MAX_BUFFER;
use crate::error::TransportError;
use crate::relay::RelayHandle;
use crate::shutdown::Shutdown;
use crate::space::Space;
use crate::stats::Counters;

/// Binds a UDP socket with its read/write buffers sized to [`MAX_BUFFER`].
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)
        .and_then(|socket| {
            socket.set_recv_buffer_size(MAX_BUFFER)?;
            socket.set_send_buffer_size(MAX_BUFFER)?;
            socket.set_nonblocking(true)?;
            socket.bind(&addr.into())?;
            Ok(socket)
        })
        .map_err(|source| TransportError::Bind { addr, source })?;

    UdpSocket::from_std(socket.into())
        .map_err(|source| TransportError::Bind { addr, source })
}

/// Runs the ingress (`Send`) loop until `shutdown` fires.
///
/// Every datagram is handed to the relay queue immediately (non-blocking publish) and to a
/// worker task that calls `Space::send`, gated by a bounded semaphore.
pub async fn ingress(
    socket: UdpSocket,
    space: Arc<Space>,
    relay: Option<RelayHandle>,
    counters: Arc<Counters>,
    workers: usize,
    mut shutdown: Shutdown,
) {
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut buf = vec![0u8; MAX_BUFFER];

    loop {
        let n = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, _src)) => n,
                Err(err) => {
                    warn!(target: "net::ingress", %err, "read failed");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        counters.rx.fetch_add(n as u64, Ordering::Relaxed);

        let data = buf[..n].to_vec();

        if let Some(relay) = &relay {
            relay.publish(data.clone());
        }

        let permits = permits.clone();
        let space = space.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            space.send(data);
        });
    }

    trace!(target: "net::ingress", "ingress loop stopped");
}

/// Runs the egress (`Scan`) loop until `shutdown` fires.
///
/// Every datagram is treated as a state key (an empty datagram is a valid, non-`None` key,
/// per `Space::scan`'s "otherwise" resume branch) and dispatched to a worker task that drives
/// `Space::scan`, writing each reply signal back to the requester's address.
pub async fn egress(
    socket: UdpSocket,
    space: Arc<Space>,
    counters: Arc<Counters>,
    workers: usize,
    mut shutdown: Shutdown,
) {
    let socket = Arc::new(socket);
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut buf = vec![0u8; MAX_BUFFER];

    loop {
        let (n, src) = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(target: "net::egress", %err, "read failed");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        counters.rx.fetch_add(n as u64, Ordering::Relaxed);

        let key = buf[..n].to_vec();
        let permits = permits.clone();
        let space = space.clone();
        let socket = socket.clone();
        let counters = counters.clone();

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            serve_scan(&socket, &space, key, src, &counters).await;
        });
    }

    trace!(target: "net::egress", "egress loop stopped");
}

async fn serve_scan(
    socket: &UdpSocket,
    space: &Arc<Space>,
    key: Vec<u8>,
    dest: SocketAddr,
    counters: &Counters,
) {
    let (tx, mut rx) = mpsc::channel(32);
    let scan = tokio::spawn({
        let space = space.clone();
        async move { space.scan(tx, Some(key)).await }
    });

    while let Some(payload) = rx.recv().await {
        match socket.send_to(&payload, dest).await {
            Ok(written) => {
                counters.tx.fetch_add(written as u64, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(target: "net::egress", %dest, %err, "reply write failed");
                break;
            }
        }
    }

    let _ = scan.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::signal;

    #[tokio::test]
    async fn ingress_appends_datagram_to_space() {
        let space = Space::new().await;
        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let (sig, shutdown) = signal();

        let task = tokio::spawn(ingress(socket, space.clone(), None, counters.clone(), 4, shutdown));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(space.count(), 1);
        assert_eq!(counters.rx.load(Ordering::Relaxed), 5);

        sig.fire().ok();
        let _ = task.await;
    }

    #[tokio::test]
    async fn egress_replies_with_scanned_signals() {
        let space = Space::new().await;
        space.send(b"a".to_vec());

        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let (sig, shutdown) = signal();

        let task = tokio::spawn(egress(socket, space.clone(), counters.clone(), 4, shutdown));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"state", addr).await.unwrap();

        let mut buf = [0u8; 8];
        let (n, _src) = tokio::time::timeout(std::time::Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"a");

        sig.fire().ok();
        let _ = task.await;
    }

    #[tokio::test]
    async fn egress_on_same_state_key_twice_emits_nothing_second_time() {
        let space = Space::new().await;
        space.send(b"a".to_vec());

        let socket = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let (sig, shutdown) = signal();

        let task = tokio::spawn(egress(socket, space.clone(), counters.clone(), 4, shutdown));
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"s", addr).await.unwrap();
        let mut buf = [0u8; 8];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"a");

        client.send_to(b"s", addr).await.unwrap();
        let second = tokio::time::timeout(std::time::Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(second.is_err(), "second scan on an unchanged state should emit nothing");

        sig.fire().ok();
        let _ = task.await;
    }
}
