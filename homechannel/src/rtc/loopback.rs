//! In-process loopback transport
//!
//! Both peers live in one process and share a [`LoopbackHub`]. The offer and
//! answer still travel through the real signaling path; only the final data
//! transport is replaced by in-memory channels. Used by tests and demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::signaling::protocol::{IceCandidate, NegotiationPayload};

use super::{
    AcceptedPeer, DataChannel, LocalOffer, PeerAnswerer, PeerTransport, PeerTransportFactory,
    TransportError,
};

const OFFER_ATTR: &str = "a=loopback-offer:";
const ANSWER_ATTR: &str = "a=loopback-answer:";

/// Rendezvous point between loopback offerers and answerers.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    /// Offer id → channel sink of the answering peer
    links: Arc<Mutex<HashMap<String, mpsc::Sender<DataChannel>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        let (connected, _) = watch::channel(false);
        LoopbackTransport {
            hub: self.clone(),
            offer_id: Mutex::new(None),
            link: Mutex::new(None),
            connected,
            closed: AtomicBool::new(false),
        }
    }

    pub fn answerer(&self) -> LoopbackAnswerer {
        LoopbackAnswerer { hub: self.clone() }
    }

    /// Answered offers whose client has not applied the answer yet.
    pub fn unclaimed(&self) -> usize {
        self.links.lock().len()
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackHub {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(Arc::new(self.transport()))
    }
}

fn session_attr(sdp: &str, attr: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(attr))
        .map(str::to_string)
}

fn host_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

/// Client side of the loopback transport
pub struct LoopbackTransport {
    hub: LoopbackHub,
    offer_id: Mutex<Option<String>>,
    link: Mutex<Option<mpsc::Sender<DataChannel>>>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<LocalOffer, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let id = uuid::Uuid::new_v4().to_string();
        *self.offer_id.lock() = Some(id.clone());

        let (tx, rx) = mpsc::channel(4);
        // Gathering completes immediately with a single host candidate
        let _ = tx.try_send(host_candidate());

        Ok(LocalOffer {
            sdp: format!("v=0\r\n{}{}\r\n", OFFER_ATTR, id),
            candidates: rx,
        })
    }

    async fn apply_answer(&self, answer: &NegotiationPayload) -> Result<(), TransportError> {
        let expected = self
            .offer_id
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Negotiation("No local offer".into()))?;
        let answered = session_attr(&answer.sdp, ANSWER_ATTR)
            .ok_or_else(|| TransportError::Negotiation("Not a loopback answer".into()))?;
        if answered != expected {
            return Err(TransportError::Negotiation(
                "Answer does not match the local offer".into(),
            ));
        }

        let link = self
            .hub
            .links
            .lock()
            .remove(&expected)
            .ok_or_else(|| TransportError::Negotiation("No peer answered this offer".into()))?;
        *self.link.lock() = Some(link);
        self.connected.send_replace(true);
        debug!("[loopback] transport {} connected", expected);
        Ok(())
    }

    async fn wait_connected(&self) -> Result<(), TransportError> {
        let mut rx = self.connected.subscribe();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            if *rx.borrow_and_update() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| TransportError::Closed)?;
        }
    }

    async fn open_channel(&self, label: &str) -> Result<DataChannel, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let link = self.link.lock().clone().ok_or(TransportError::NotConnected)?;
        let (local, remote) = DataChannel::pair(label);
        link.send(remote)
            .await
            .map_err(|_| TransportError::ChannelOpen("Remote peer is gone".into()))?;
        Ok(local)
    }

    async fn closed(&self) -> TransportError {
        let mut state = self.connected.subscribe();
        let local = async {
            while !self.closed.load(Ordering::Acquire) {
                if state.changed().await.is_err() {
                    break;
                }
            }
        };
        let link = self.link.lock().clone();
        match link {
            Some(link) => tokio::select! {
                _ = link.closed() => TransportError::Backend("Remote peer is gone".into()),
                _ = local => TransportError::Closed,
            },
            None => {
                local.await;
                TransportError::Closed
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.lock().take();
        if let Some(id) = self.offer_id.lock().take() {
            self.hub.links.lock().remove(&id);
        }
        self.connected.send_replace(false);
    }
}

/// Agent side of the loopback transport
pub struct LoopbackAnswerer {
    hub: LoopbackHub,
}

#[async_trait]
impl PeerAnswerer for LoopbackAnswerer {
    async fn answer(
        &self,
        offer: &NegotiationPayload,
        _gather_timeout: Duration,
    ) -> Result<(NegotiationPayload, Box<dyn AcceptedPeer>), TransportError> {
        let id = session_attr(&offer.sdp, OFFER_ATTR)
            .ok_or_else(|| TransportError::Negotiation("Not a loopback offer".into()))?;

        let (tx, rx) = mpsc::channel(16);
        self.hub.links.lock().insert(id.clone(), tx);

        let answer = NegotiationPayload {
            sdp: format!("v=0\r\n{}{}\r\n", ANSWER_ATTR, id),
            candidates: vec![host_candidate()],
        };
        Ok((answer, Box::new(LoopbackAccepted { channels: rx })))
    }
}

struct LoopbackAccepted {
    channels: mpsc::Receiver<DataChannel>,
}

#[async_trait]
impl AcceptedPeer for LoopbackAccepted {
    async fn next_channel(&mut self) -> Option<DataChannel> {
        self.channels.recv().await
    }

    async fn close(&mut self) {
        self.channels.close();
    }
}
