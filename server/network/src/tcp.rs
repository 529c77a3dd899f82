//! Tokio glue between sans-io sockets and the OS. The transport runs on
//! its own runtime; everything that happens on a connection is reported
//! through the event sink, which the node assembly turns into requests to
//! the worker owning the socket.

use bytes::Bytes;
use logd_primitives::NodeIndex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Identifies one TCP connection for the lifetime of the process.
pub type ConnectionToken = u64;

pub enum TransportEvent {
    /// Inbound connection accepted.
    Accepted { conn: ConnectionHandle, peer_addr: SocketAddr },
    /// Outbound connect finished.
    Connected { node: NodeIndex, conn: ConnectionHandle },
    ConnectFailed { node: NodeIndex },
    /// Bytes arrived on a connection.
    Received { token: ConnectionToken, data: Bytes },
    /// Bytes were handed to the OS.
    Written { token: ConnectionToken, n: usize },
    /// The connection died (EOF or error).
    Closed { token: ConnectionToken },
}

pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Write half of one connection, held by whoever owns the corresponding
/// Socket. Dropping it closes the connection.
pub struct ConnectionHandle {
    pub token: ConnectionToken,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionHandle {
    pub fn send(&self, bytes: Bytes) {
        // A failed send means the write task is gone; the Closed event is
        // already on its way.
        let _ = self.tx.send(bytes);
    }
}

pub struct Transport {
    runtime: tokio::runtime::Runtime,
    sink: EventSink,
    next_token: Arc<AtomicU64>,
}

impl Transport {
    pub fn new(sink: EventSink) -> std::io::Result<Transport> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("logd:net")
            .enable_all()
            .build()?;
        Ok(Transport { runtime, sink, next_token: Arc::new(AtomicU64::new(1)) })
    }

    /// Accept loop for the server port. Runs until the transport drops.
    pub fn listen(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = self.runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;
        let sink = self.sink.clone();
        let next_token = self.next_token.clone();
        self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!(target: "network", from = %peer_addr, "got new connection");
                        let conn = spawn_connection(stream, &sink, &next_token);
                        sink(TransportEvent::Accepted { conn, peer_addr });
                    }
                    Err(e) => {
                        tracing::warn!(target: "network", err = %e, "accept failed");
                    }
                }
            }
        });
        Ok(local_addr)
    }

    pub fn connect(&self, node: NodeIndex, addr: SocketAddr, timeout: Duration) {
        self.connect_after(node, addr, Duration::ZERO, timeout)
    }

    pub fn connect_after(
        &self,
        node: NodeIndex,
        addr: SocketAddr,
        delay: Duration,
        timeout: Duration,
    ) {
        let sink = self.sink.clone();
        let next_token = self.next_token.clone();
        self.runtime.spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let conn = spawn_connection(stream, &sink, &next_token);
                    sink(TransportEvent::Connected { node, conn });
                }
                Ok(Err(e)) => {
                    tracing::debug!(target: "network", node, %addr, err = %e, "connect failed");
                    sink(TransportEvent::ConnectFailed { node });
                }
                Err(_) => {
                    tracing::debug!(target: "network", node, %addr, "connect timed out");
                    sink(TransportEvent::ConnectFailed { node });
                }
            }
        });
    }
}

fn spawn_connection(
    stream: TcpStream,
    sink: &EventSink,
    next_token: &Arc<AtomicU64>,
) -> ConnectionHandle {
    let token = next_token.fetch_add(1, Ordering::Relaxed);
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let read_sink = sink.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    read_sink(TransportEvent::Closed { token });
                    return;
                }
                Ok(n) => {
                    read_sink(TransportEvent::Received {
                        token,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    });
                }
            }
        }
    });

    let write_sink = sink.clone();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let n = bytes.len();
            if write_half.write_all(&bytes).await.is_err() {
                write_sink(TransportEvent::Closed { token });
                return;
            }
            write_sink(TransportEvent::Written { token, n });
        }
        // Channel closed: owner dropped the handle; shut the stream down.
        let _ = write_half.shutdown().await;
    });

    ConnectionHandle { token, tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel as channel;

    #[test]
    fn loopback_round_trip() {
        let (tx, rx) = channel::unbounded();
        let sink: EventSink = Arc::new(move |ev| {
            let _ = tx.send(ev);
        });
        let transport = Transport::new(sink).unwrap();
        let addr = transport.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        transport.connect(1, addr, Duration::from_secs(5));

        let mut client_conn = None;
        let mut server_conn = None;
        let deadline = Duration::from_secs(5);
        while client_conn.is_none() || server_conn.is_none() {
            match rx.recv_timeout(deadline).unwrap() {
                TransportEvent::Connected { node, conn } => {
                    assert_eq!(node, 1);
                    client_conn = Some(conn);
                }
                TransportEvent::Accepted { conn, .. } => server_conn = Some(conn),
                _ => {}
            }
        }

        client_conn.as_ref().unwrap().send(Bytes::from_static(b"ping"));
        loop {
            match rx.recv_timeout(deadline).unwrap() {
                TransportEvent::Received { data, token } => {
                    assert_eq!(token, server_conn.as_ref().unwrap().token);
                    assert_eq!(&data[..], b"ping");
                    break;
                }
                TransportEvent::Written { n, .. } => assert_eq!(n, 4),
                _ => {}
            }
        }
    }
}
