//! UDP transport for the RALE wire protocol.
//!
//! A callback-based API (`server_init(port, cb)` storing a function
//! pointer that a poll loop invokes inline) is one way to deliver
//! datagrams; this wraps a `tokio::net::UdpSocket` and exposes received
//! datagrams as `(SocketAddr, String)` pairs pulled from an `mpsc`
//! channel instead, so no transport-internal lock is ever held while
//! a handler runs.

use crate::error::{RaleError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub const UDP_BUFFER_SIZE: usize = 1024;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:port` and spawn a task that forwards every
    /// received datagram onto the returned channel. All RALE messages
    /// are ASCII and newline-free, delivered as a single datagram.
    pub async fn bind(port: u16) -> Result<(Self, mpsc::UnboundedReceiver<(SocketAddr, String)>)> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| RaleError::Network(format!("udp bind failed: {e}")))?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();

        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = [0u8; UDP_BUFFER_SIZE];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => {
                        let msg = String::from_utf8_lossy(&buf[..n]).to_string();
                        if tx.send((addr, msg)).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        // Transient recv errors are not fatal; keep polling.
                        continue;
                    }
                }
            }
        });

        Ok((Self { socket }, rx))
    }

    pub async fn send_to(&self, msg: &str, addr: SocketAddr) -> Result<()> {
        self.socket
            .send_to(msg.as_bytes(), addr)
            .await
            .map(|_| ())
            .map_err(|e| RaleError::Network(format!("udp send failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_receive_roundtrip() {
        let (a, mut a_rx) = UdpTransport::bind(0).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(0).await.unwrap();
        let a_addr = a.socket.local_addr().unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        a.send_to("HEARTBEAT 1 5", b_addr).await.unwrap();
        let (from, msg) = b_rx.recv().await.unwrap();
        assert_eq!(msg, "HEARTBEAT 1 5");
        assert_eq!(from.port(), a_addr.port());

        b.send_to("HEARTBEAT_ACK", a_addr).await.unwrap();
        let (_, msg) = a_rx.recv().await.unwrap();
        assert_eq!(msg, "HEARTBEAT_ACK");
    }
}
