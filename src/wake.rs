//! Optional multicast fast path.
//!
//! Compact JSON datagrams shorten convergence on a LAN; they are purely
//! advisory. Anything learned here is also observable through the
//! filesystem, which stays authoritative. Receivers only use packets as a
//! nudge to poll their inboxes sooner.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 42, 0, 1);

/// Datagrams above this size are dropped silently instead of fragmenting.
const MTU_GUARD: usize = 1400;

pub struct DatagramWake {
    socket: UdpSocket,
    group: SocketAddrV4,
    node_id: String,
    subscribers: Mutex<Vec<Arc<Notify>>>,
}

impl DatagramWake {
    /// Join the multicast group and start the receive task. Any bind or
    /// join failure disables the fast path without failing the node.
    pub async fn start(
        node_id: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> Option<Arc<Self>> {
        let socket = match bind_multicast(port).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Datagram wake disabled (bind failed)");
                return None;
            }
        };

        let wake = Arc::new(Self {
            socket,
            group: SocketAddrV4::new(DEFAULT_GROUP, port),
            node_id: node_id.to_string(),
            subscribers: Mutex::new(Vec::new()),
        });

        let recv = Arc::clone(&wake);
        tokio::spawn(async move {
            recv.run(cancel).await;
        });

        Some(wake)
    }

    /// Register a notify handle poked whenever a command datagram addressed
    /// to this node arrives.
    pub fn subscribe(&self, notify: Arc<Notify>) {
        self.subscribers.lock().push(notify);
    }

    /// Fire-and-forget send to the group. Oversized payloads are dropped.
    pub fn announce(&self, value: &serde_json::Value) {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        if bytes.len() > MTU_GUARD {
            return;
        }
        let _ = self.socket.try_send_to(&bytes, self.group.into());
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MTU_GUARD + 1];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            let Ok((len, _addr)) = received else {
                continue;
            };
            if len > MTU_GUARD {
                continue;
            }

            let Ok(value) = serde_json::from_slice::<serde_json::Value>(&buf[..len]) else {
                continue;
            };

            // Filter our own packets; multicast loops back by default.
            let from = value.get("from").and_then(|v| v.as_str()).unwrap_or("");
            if from == self.node_id {
                continue;
            }

            let kind = value.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if kind == "command" {
                let target = value.get("target").and_then(|v| v.as_str()).unwrap_or("");
                if target.is_empty() || target == self.node_id {
                    for notify in self.subscribers.lock().iter() {
                        notify.notify_one();
                    }
                }
            }
        }
    }
}

async fn bind_multicast(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.join_multicast_v4(DEFAULT_GROUP, Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}
