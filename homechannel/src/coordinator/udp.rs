//! Agent-facing UDP loop
//!
//! One socket carries both directions: datagrams from agents are handled
//! inline and answered to their source address; offers produced by `connect`
//! arrive through the outbound queue and go to the agent's last known address.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::datagram::{AgentDatagram, CoordinatorDatagram, MAX_DATAGRAM_SIZE};
use super::{Coordinator, Outbound};

/// Serve agents on `socket` until `shutdown` fires.
pub async fn serve_agents(
    socket: UdpSocket,
    coordinator: Arc<Coordinator>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        debug!("[udp] recv error: {}", e);
                        continue;
                    }
                };
                let datagram = match AgentDatagram::decode(&buf[..len]) {
                    Ok(d) => d,
                    Err(e) => {
                        debug!("[udp] dropping malformed datagram from {}: {}", from, e);
                        continue;
                    }
                };
                for reply in coordinator.handle_agent_datagram(from, datagram) {
                    send(&socket, from, &reply).await;
                }
            }
            Some(out) = outbound_rx.recv() => {
                send(&socket, out.to, &out.datagram).await;
            }
            _ = shutdown.cancelled() => {
                info!("[udp] agent listener shutting down");
                break;
            }
        }
    }
}

async fn send(socket: &UdpSocket, to: SocketAddr, datagram: &CoordinatorDatagram) {
    let bytes = match datagram.encode() {
        Ok(b) => b,
        Err(e) => {
            warn!("[udp] failed to encode datagram: {}", e);
            return;
        }
    };
    if bytes.len() > MAX_DATAGRAM_SIZE {
        warn!("[udp] datagram to {} exceeds {} bytes, dropped", to, MAX_DATAGRAM_SIZE);
        return;
    }
    if let Err(e) = socket.send_to(&bytes, to).await {
        debug!("[udp] send to {} failed: {}", to, e);
    }
}
