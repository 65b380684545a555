//! HomeChannel Agent Runtime
//!
//! Runs next to the resources being exposed. It keeps itself registered with
//! the coordinator over UDP, answers relayed offers and serves the resulting
//! peer channels through the [`ChannelRouter`].
//!
//! ```text
//!      register / keepalive (+ challenge batch, signed)
//!  Agent ───────────────────────────────────────────▸ Coordinator
//!        ◂─────────── registered / keepaliveAck / unknown / offer
//!        ──── answer (signed, re-sent every tick) ──▸
//!        ◂─────────── answerAck
//! ```
//!
//! - Offers are de-duplicated by session id; a redelivered offer re-sends the
//!   answer already produced instead of negotiating again
//! - The client's challenge answer is re-verified here before answering

pub mod identity;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::apps::ChannelRouter;
use crate::config::{AgentConfig, ConfigError};
use crate::coordinator::datagram::MAX_DATAGRAM_SIZE;
use crate::coordinator::{AgentDatagram, CoordinatorDatagram, PresenceKind};
use crate::crypto::{key_fingerprint, ChallengeAuthenticator, SignatureError};
use crate::rtc::{AcceptedPeer, PeerAnswerer, TransportError};
use crate::signaling::protocol::{NegotiationPayload, SignedAnswer};

pub use identity::AgentIdentity;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot resolve coordinator address: {0}")]
    Resolve(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Outgoing datagrams queued by offer tasks
const OUTBOUND_QUEUE: usize = 64;

/// Agent runtime
pub struct AgentRuntime {
    config: AgentConfig,
    identity: Arc<AgentIdentity>,
    authenticator: ChallengeAuthenticator,
    answerer: Arc<dyn PeerAnswerer>,
    router: Arc<ChannelRouter>,
    /// Session ids already seen, for de-duplicating redelivered offers
    answered: Mutex<HashMap<String, Instant>>,
    /// Answers not yet acknowledged by the coordinator
    unacked: Mutex<HashMap<String, (SignedAnswer, Instant)>>,
    registered: AtomicBool,
    /// Timestamp of the last signed register/keepalive
    last_presence_at: AtomicI64,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        identity: Arc<AgentIdentity>,
        answerer: Arc<dyn PeerAnswerer>,
        router: Arc<ChannelRouter>,
    ) -> Self {
        let authenticator =
            ChallengeAuthenticator::new(config.password.clone(), config.challenge_ttl());
        Self {
            config,
            identity,
            authenticator,
            answerer,
            router,
            answered: Mutex::new(HashMap::new()),
            unacked: Mutex::new(HashMap::new()),
            registered: AtomicBool::new(false),
            last_presence_at: AtomicI64::new(0),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Resolve the coordinator and run until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), AgentError> {
        let addr: SocketAddr = tokio::net::lookup_host(&self.config.coordinator_addr)
            .await?
            .next()
            .ok_or_else(|| AgentError::Resolve(self.config.coordinator_addr.clone()))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        info!(
            "[agent] {} registering with coordinator {}",
            key_fingerprint(&self.identity.public_key()),
            addr
        );
        self.run_on(socket, shutdown).await
    }

    /// Run on a socket already connected to the coordinator.
    pub async fn run_on(
        self: Arc<Self>,
        socket: UdpSocket,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let (out_tx, mut out_rx) = mpsc::channel::<AgentDatagram>(OUTBOUND_QUEUE);
        let mut ticker = tokio::time::interval(self.config.keepalive_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.on_tick(&socket).await,
                Some(datagram) = out_rx.recv() => send(&socket, &datagram).await,
                received = socket.recv(&mut buf) => match received {
                    Ok(n) => match CoordinatorDatagram::decode(&buf[..n]) {
                        Ok(datagram) => {
                            self.on_datagram(datagram, &socket, &out_tx, &shutdown).await
                        }
                        Err(e) => debug!("[agent] ignoring malformed datagram: {}", e),
                    },
                    // Connected UDP sockets surface ICMP unreachable here
                    Err(e) => debug!("[agent] receive failed: {}", e),
                },
            }
        }

        info!("[agent] shutting down");
        Ok(())
    }

    /// Signed register/keepalive with a fresh challenge batch.
    ///
    /// Timestamps are wall-clock milliseconds, bumped so that each one is
    /// strictly greater than the last; the coordinator refuses anything else.
    fn presence_datagram(&self, kind: PresenceKind) -> Option<AgentDatagram> {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_presence_at
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let timestamp = now.max(previous + 1);
        let challenges = self.authenticator.issue_batch(self.config.challenge_batch);
        match self.identity.presence(kind, timestamp, challenges) {
            Ok(datagram) => Some(datagram),
            Err(e) => {
                warn!("[agent] cannot sign {:?}: {}", kind, e);
                None
            }
        }
    }

    async fn on_tick(&self, socket: &UdpSocket) {
        let cache = self.config.answered_cache();
        self.answered
            .lock()
            .retain(|_, seen| seen.elapsed() < cache);
        let resend: Vec<SignedAnswer> = {
            let mut unacked = self.unacked.lock();
            unacked.retain(|_, (_, at)| at.elapsed() < cache);
            unacked.values().map(|(a, _)| a.clone()).collect()
        };

        let kind = if self.is_registered() {
            PresenceKind::Keepalive
        } else {
            PresenceKind::Register
        };
        if let Some(heartbeat) = self.presence_datagram(kind) {
            send(socket, &heartbeat).await;
        }

        for answer in resend {
            debug!("[agent] re-sending answer for session {}", answer.session_id);
            send(socket, &AgentDatagram::Answer { answer }).await;
        }
    }

    async fn on_datagram(
        self: &Arc<Self>,
        datagram: CoordinatorDatagram,
        socket: &UdpSocket,
        out_tx: &mpsc::Sender<AgentDatagram>,
        shutdown: &CancellationToken,
    ) {
        match datagram {
            CoordinatorDatagram::Registered {
                server_timeout_secs,
            } => {
                if !self.registered.swap(true, Ordering::AcqRel) {
                    info!(
                        "[agent] registered (server timeout {}s)",
                        server_timeout_secs
                    );
                }
            }
            CoordinatorDatagram::KeepaliveAck => debug!("[agent] keepalive acknowledged"),
            CoordinatorDatagram::Unknown => {
                self.registered.store(false, Ordering::Release);
                info!("[agent] coordinator lost our registration, re-registering");
                if let Some(register) = self.presence_datagram(PresenceKind::Register) {
                    send(socket, &register).await;
                }
            }
            CoordinatorDatagram::Rejected { reason } => {
                self.registered.store(false, Ordering::Release);
                warn!("[agent] registration rejected: {}", reason);
            }
            CoordinatorDatagram::Offer {
                session_id,
                payload,
                challenge,
                challenge_answer,
            } => {
                if self.answered.lock().contains_key(&session_id) {
                    let pending = self
                        .unacked
                        .lock()
                        .get(&session_id)
                        .map(|(a, _)| a.clone());
                    if let Some(answer) = pending {
                        debug!("[agent] offer {} redelivered, re-sending answer", session_id);
                        send(socket, &AgentDatagram::Answer { answer }).await;
                    }
                    return;
                }
                self.answered
                    .lock()
                    .insert(session_id.clone(), Instant::now());

                let runtime = Arc::clone(self);
                let out_tx = out_tx.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    runtime
                        .handle_offer(session_id, payload, challenge, challenge_answer, out_tx, shutdown)
                        .await;
                });
            }
            CoordinatorDatagram::AnswerAck { session_id, status } => {
                self.unacked.lock().remove(&session_id);
                debug!("[agent] answer for {} acknowledged: {:?}", session_id, status);
            }
        }
    }

    async fn handle_offer(
        self: Arc<Self>,
        session_id: String,
        offer: NegotiationPayload,
        challenge: String,
        challenge_answer: String,
        out_tx: mpsc::Sender<AgentDatagram>,
        shutdown: CancellationToken,
    ) {
        if !self.authenticator.verify_answer(&challenge, &challenge_answer) {
            warn!("[agent] offer {} failed challenge verification", session_id);
            return;
        }

        let (payload, accepted) = match self
            .answerer
            .answer(&offer, self.config.ice_gathering_timeout())
            .await
        {
            Ok(answered) => answered,
            Err(e) => {
                warn!("[agent] cannot answer offer {}: {}", session_id, e);
                return;
            }
        };

        let timestamp = chrono::Utc::now().timestamp_millis();
        let answer = match self.identity.sign_answer(&session_id, timestamp, payload) {
            Ok(a) => a,
            Err(e) => {
                warn!("[agent] cannot sign answer for {}: {}", session_id, e);
                return;
            }
        };

        self.unacked
            .lock()
            .insert(session_id.clone(), (answer.clone(), Instant::now()));
        if out_tx.send(AgentDatagram::Answer { answer }).await.is_err() {
            return;
        }
        info!("[agent] answered session {}", session_id);

        self.serve_peer(accepted, shutdown).await;
    }

    async fn serve_peer(&self, mut accepted: Box<dyn AcceptedPeer>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                channel = accepted.next_channel() => match channel {
                    Some(channel) => {
                        self.router.serve_channel(channel);
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        accepted.close().await;
        debug!("[agent] peer closed");
    }
}

async fn send(socket: &UdpSocket, datagram: &AgentDatagram) {
    let bytes = match datagram.encode() {
        Ok(b) => b,
        Err(e) => {
            warn!("[agent] cannot encode datagram: {}", e);
            return;
        }
    };
    if bytes.len() > MAX_DATAGRAM_SIZE {
        warn!("[agent] dropping oversized datagram ({} bytes)", bytes.len());
        return;
    }
    if let Err(e) = socket.send(&bytes).await {
        debug!("[agent] send failed: {}", e);
    }
}
