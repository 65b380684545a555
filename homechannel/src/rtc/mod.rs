//! Peer transport abstraction
//!
//! The direct client ↔ agent transport negotiated through the coordinator.
//!
//! ```text
//!  client                                     agent
//!  PeerTransport ── offer ──▸ (coordinator) ──▸ PeerAnswerer
//!       ▲                                           │
//!       └──────── answer ◂── (coordinator) ◂────────┘
//!  open_channel(label) ═════ DataChannel ═════▸ AcceptedPeer::next_channel
//! ```
//!
//! Implementations:
//! - [`loopback`]: in-process, always available
//! - `webrtc` (feature `webrtc`): WebRTC data channels via webrtc-rs

pub mod loopback;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::protocol::{IceCandidate, NegotiationPayload};

/// Buffered messages per channel direction.
pub const CHANNEL_BUFFER: usize = 256;

/// Peer transport errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,

    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    #[error("Transport backend error: {0}")]
    Backend(String),
}

/// One logical, message-oriented channel over a peer transport.
///
/// Messages are JSON text. Dropping the sender half closes the channel for
/// the remote side; the receiver yields `None` once the remote side closed.
#[derive(Debug)]
pub struct DataChannel {
    label: String,
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<String>,
}

impl DataChannel {
    pub fn new(
        label: impl Into<String>,
        outgoing: mpsc::Sender<String>,
        incoming: mpsc::Receiver<String>,
    ) -> Self {
        Self {
            label: label.into(),
            outgoing,
            incoming,
        }
    }

    /// Two connected ends of a channel.
    pub fn pair(label: &str) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_BUFFER);
        (Self::new(label, a_tx, b_rx), Self::new(label, b_tx, a_rx))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(text)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    pub fn into_parts(self) -> (String, mpsc::Sender<String>, mpsc::Receiver<String>) {
        (self.label, self.outgoing, self.incoming)
    }
}

/// A local offer plus the stream of candidates still being gathered.
///
/// The candidate receiver ends when gathering completes.
pub struct LocalOffer {
    pub sdp: String,
    pub candidates: mpsc::Receiver<IceCandidate>,
}

/// Client side of a peer transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the local offer and start candidate gathering.
    async fn create_offer(&self) -> Result<LocalOffer, TransportError>;

    /// Apply the remote answer and its candidates.
    async fn apply_answer(&self, answer: &NegotiationPayload) -> Result<(), TransportError>;

    /// Resolve once the transport is open.
    async fn wait_connected(&self) -> Result<(), TransportError>;

    /// Open a new logical channel with `label`.
    async fn open_channel(&self, label: &str) -> Result<DataChannel, TransportError>;

    /// Resolve once the transport can no longer carry channels.
    ///
    /// Yields [`TransportError::Closed`] after a local [`close`](Self::close)
    /// and another error when the remote side went away.
    async fn closed(&self) -> TransportError;

    /// Tear down the transport. Idempotent.
    async fn close(&self);
}

/// Creates one [`PeerTransport`] per connection attempt.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// A peer the agent has answered; yields the channels the client opens.
#[async_trait]
pub trait AcceptedPeer: Send {
    /// Next channel opened by the remote side, or `None` once the peer is gone.
    async fn next_channel(&mut self) -> Option<DataChannel>;

    async fn close(&mut self);
}

/// Agent side of a peer transport.
#[async_trait]
pub trait PeerAnswerer: Send + Sync {
    /// Accept an offer, gathering local candidates for at most `gather_timeout`.
    async fn answer(
        &self,
        offer: &NegotiationPayload,
        gather_timeout: Duration,
    ) -> Result<(NegotiationPayload, Box<dyn AcceptedPeer>), TransportError>;
}

/// Drain candidates until gathering completes or `timeout` passes.
///
/// Whatever arrived before the deadline is returned; gathering is abandoned
/// after that.
pub async fn collect_candidates(
    candidates: &mut mpsc::Receiver<IceCandidate>,
    timeout: Duration,
) -> Vec<IceCandidate> {
    let mut gathered = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, candidates.recv()).await {
            Ok(Some(c)) => gathered.push(c),
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(
                    "[rtc] candidate gathering abandoned after {:?} with {} candidates",
                    timeout,
                    gathered.len()
                );
                break;
            }
        }
    }
    gathered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_until_complete() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(candidate(1)).await.unwrap();
        tx.send(candidate(2)).await.unwrap();
        drop(tx);
        let got = collect_candidates(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(got.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_abandons_slow_gathering() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(candidate(1)).await.unwrap();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = tx.send(candidate(2)).await;
        });
        let got = collect_candidates(&mut rx, Duration::from_secs(3)).await;
        assert_eq!(got, vec![candidate(1)]);
        late.abort();
    }

    #[tokio::test]
    async fn test_channel_pair() {
        let (a, mut b) = DataChannel::pair("files");
        a.send("hello".into()).await.unwrap();
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
        drop(a);
        assert_eq!(b.recv().await, None);
        assert_eq!(b.label(), "files");
    }
}
