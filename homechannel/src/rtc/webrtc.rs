//! WebRTC peer transport (webrtc-rs)
//!
//! Every logical channel is one SCTP data channel. The offerer creates a
//! bootstrap channel before its offer so the SDP carries an application
//! section; channels opened afterwards need no renegotiation.
//!
//! Data channel callbacks are bridged onto the mpsc pair inside
//! [`DataChannel`]: `on_message` feeds the receiver, a pump task drains the
//! sender into `send_text`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::signaling::protocol::{IceCandidate, NegotiationPayload};

use super::{
    collect_candidates, AcceptedPeer, DataChannel, LocalOffer, PeerAnswerer, PeerTransport,
    PeerTransportFactory, TransportError, CHANNEL_BUFFER,
};

/// Label of the channel created only to make the offer carry SCTP.
pub const BOOTSTRAP_LABEL: &str = "homechannel-bootstrap";

fn backend(e: impl std::fmt::Display) -> TransportError {
    TransportError::Backend(e.to_string())
}

async fn new_peer_connection(
    ice_servers: &[String],
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let api = APIBuilder::new().build();
    let mut config = RTCConfiguration::default();
    if !ice_servers.is_empty() {
        config.ice_servers = vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }];
    }
    let pc = api.new_peer_connection(config).await.map_err(backend)?;
    Ok(Arc::new(pc))
}

/// Forward local candidates until gathering completes (the `None` candidate).
fn forward_candidates(pc: &RTCPeerConnection) -> mpsc::Receiver<IceCandidate> {
    let (tx, rx) = mpsc::channel(64);
    let tx = Arc::new(Mutex::new(Some(tx)));
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                tx.lock().take();
                return;
            };
            let sender = tx.lock().clone();
            if let (Some(sender), Ok(init)) = (sender, candidate.to_json()) {
                let _ = sender
                    .send(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })
                    .await;
            }
        })
    }));
    rx
}

async fn add_remote_candidates(
    pc: &RTCPeerConnection,
    candidates: &[IceCandidate],
) -> Result<(), TransportError> {
    for c in candidates {
        let init = RTCIceCandidateInit {
            candidate: c.candidate.clone(),
            sdp_mid: c.sdp_mid.clone(),
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            // One bad candidate must not sink the rest
            debug!("[webrtc] ignoring remote candidate: {}", e);
        }
    }
    Ok(())
}

/// Bridge an open RTC data channel onto a [`DataChannel`].
fn bridge(dc: Arc<RTCDataChannel>) -> DataChannel {
    let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_BUFFER);

    let in_tx = Arc::new(Mutex::new(Some(in_tx)));
    let on_msg_tx = in_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = on_msg_tx.lock().clone();
        Box::pin(async move {
            let Some(tx) = tx else { return };
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(text).await;
                }
                Err(_) => debug!("[webrtc] dropping binary message"),
            }
        })
    }));
    dc.on_close(Box::new(move || {
        in_tx.lock().take();
        Box::pin(async {})
    }));

    let pump = dc.clone();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = pump.send_text(text).await {
                warn!("[webrtc] send on {} failed: {}", pump.label(), e);
                break;
            }
        }
        let _ = pump.close().await;
    });

    DataChannel::new(dc.label().to_string(), out_tx, in_rx)
}

/// States after which the peer connection carries nothing more.
fn peer_gone(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// Client side
// ═══════════════════════════════════════════════════════════════════════════

/// Creates [`WebRtcTransport`]s.
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcFactory {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(Arc::new(WebRtcTransport::new(&self.ice_servers).await?))
    }
}

/// Client-side WebRTC transport
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    state: watch::Receiver<RTCPeerConnectionState>,
}

impl WebRtcTransport {
    pub async fn new(ice_servers: &[String]) -> Result<Self, TransportError> {
        let pc = new_peer_connection(ice_servers).await?;
        let (state_tx, state) = watch::channel(RTCPeerConnectionState::New);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!("[webrtc] peer connection state: {}", s);
            let _ = state_tx.send(s);
            Box::pin(async {})
        }));
        Ok(Self { pc, state })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<LocalOffer, TransportError> {
        self.pc
            .create_data_channel(BOOTSTRAP_LABEL, None)
            .await
            .map_err(backend)?;

        let candidates = forward_candidates(&self.pc);
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(backend)?;
        Ok(LocalOffer { sdp, candidates })
    }

    async fn apply_answer(&self, answer: &NegotiationPayload) -> Result<(), TransportError> {
        let desc = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        add_remote_candidates(&self.pc, &answer.candidates).await
    }

    async fn wait_connected(&self) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                RTCPeerConnectionState::Connected => return Ok(()),
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    return Err(TransportError::NotConnected)
                }
                _ => {}
            }
            state.changed().await.map_err(|_| TransportError::Closed)?;
        }
    }

    async fn open_channel(&self, label: &str) -> Result<DataChannel, TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| TransportError::ChannelOpen(e.to_string()))?;

        let (open_tx, open_rx) = oneshot::channel::<()>();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(());
            Box::pin(async {})
        }));
        open_rx.await.map_err(|_| TransportError::Closed)?;
        Ok(bridge(dc))
    }

    async fn closed(&self) -> TransportError {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current == RTCPeerConnectionState::Closed {
                return TransportError::Closed;
            }
            if peer_gone(current) {
                return TransportError::Backend(format!("peer connection {}", current));
            }
            if state.changed().await.is_err() {
                return TransportError::Closed;
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("[webrtc] close: {}", e);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Agent side
// ═══════════════════════════════════════════════════════════════════════════

/// Agent-side WebRTC answerer
#[derive(Debug, Clone)]
pub struct WebRtcAnswerer {
    ice_servers: Vec<String>,
}

impl WebRtcAnswerer {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerAnswerer for WebRtcAnswerer {
    async fn answer(
        &self,
        offer: &NegotiationPayload,
        gather_timeout: Duration,
    ) -> Result<(NegotiationPayload, Box<dyn AcceptedPeer>), TransportError> {
        let pc = new_peer_connection(&self.ice_servers).await?;

        let (chan_tx, chan_rx) = mpsc::channel::<DataChannel>(16);
        let sink = ChannelSink::new(chan_tx);

        let on_state = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!("[webrtc] answered peer state: {}", s);
            if peer_gone(s) {
                on_state.release();
            }
            Box::pin(async {})
        }));

        let on_channel = sink.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = on_channel.clone();
            Box::pin(async move {
                if dc.label() == BOOTSTRAP_LABEL {
                    return;
                }
                let opened = dc.clone();
                dc.on_open(Box::new(move || {
                    let sender = sink.sender();
                    Box::pin(async move {
                        if let Some(sender) = sender {
                            let _ = sender.send(bridge(opened)).await;
                        }
                    })
                }));
            })
        }));

        let desc = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        add_remote_candidates(&pc, &offer.candidates).await?;

        let mut candidates = forward_candidates(&pc);
        let answer = pc.create_answer(None).await.map_err(backend)?;
        let sdp = answer.sdp.clone();
        pc.set_local_description(answer).await.map_err(backend)?;
        let candidates = collect_candidates(&mut candidates, gather_timeout).await;

        info!(
            "[webrtc] answered offer with {} local candidates",
            candidates.len()
        );
        Ok((
            NegotiationPayload { sdp, candidates },
            Box::new(WebRtcAccepted {
                pc,
                sink,
                channels: chan_rx,
            }),
        ))
    }
}

/// Where channels opened by the remote side are delivered.
///
/// The only sender lives here; releasing it ends
/// [`AcceptedPeer::next_channel`] even while the peer connection still holds
/// its callbacks.
#[derive(Clone)]
struct ChannelSink(Arc<Mutex<Option<mpsc::Sender<DataChannel>>>>);

impl ChannelSink {
    fn new(tx: mpsc::Sender<DataChannel>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    fn sender(&self) -> Option<mpsc::Sender<DataChannel>> {
        self.0.lock().clone()
    }

    fn release(&self) {
        self.0.lock().take();
    }
}

struct WebRtcAccepted {
    pc: Arc<RTCPeerConnection>,
    sink: ChannelSink,
    channels: mpsc::Receiver<DataChannel>,
}

#[async_trait]
impl AcceptedPeer for WebRtcAccepted {
    async fn next_channel(&mut self) -> Option<DataChannel> {
        self.channels.recv().await
    }

    async fn close(&mut self) {
        self.sink.release();
        self.channels.close();
        let _ = self.pc.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(peer_gone(RTCPeerConnectionState::Disconnected));
        assert!(peer_gone(RTCPeerConnectionState::Failed));
        assert!(peer_gone(RTCPeerConnectionState::Closed));
        assert!(!peer_gone(RTCPeerConnectionState::Connecting));
        assert!(!peer_gone(RTCPeerConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_released_sink_ends_channel_stream() {
        let (tx, mut rx) = mpsc::channel::<DataChannel>(4);
        let sink = ChannelSink::new(tx);
        // Callbacks keep their own handle to the sink
        let held_by_callback = sink.clone();

        let (local, _remote) = DataChannel::pair("files");
        held_by_callback.sender().unwrap().send(local).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().label(), "files");

        sink.release();
        assert!(held_by_callback.sender().is_none());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_answered_peer_yields_no_channels() {
        let pc = new_peer_connection(&[]).await.unwrap();
        let (tx, rx) = mpsc::channel::<DataChannel>(4);
        let sink = ChannelSink::new(tx);
        let mut accepted = WebRtcAccepted {
            pc,
            sink: sink.clone(),
            channels: rx,
        };
        accepted.close().await;
        assert!(accepted.next_channel().await.is_none());
        assert!(sink.sender().is_none());
    }
}
