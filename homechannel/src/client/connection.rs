//! Client connection establishment
//!
//! One attempt walks these steps strictly in order, each bounded by its own
//! timeout:
//!
//! ```text
//!  1 open signaling ─► 2 getServerInfo ─► 3 compute answer ─► 4 offer + gather
//!        ─► 5 connect ─► 6 poll ─► 7 verify signature ─► 8 apply + wait open
//!        ─► 9 close signaling ─► 10 Connected
//! ```
//!
//! Any failure releases the signaling channel and the transport, reverts to
//! `Disconnected`, notifies observers and is returned to the caller. Dropping
//! the `connect` future does the same, minus the caller.
//!
//! Once connected, a watcher follows the transport: if it closes underneath
//! the connection, the multiplexer is closed and the connection goes back to
//! `Disconnected` with the reason.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::events::{ConnectionEvent, EventBus};
use super::mux::{ChannelMultiplexer, MuxConfig};
use super::state::{ConnectionState, ConnectionStateMachine};
use crate::config::ClientConfig;
use crate::crypto::{
    compute_answer, key_fingerprint, normalize_public_key, verify, SignatureAlgorithm,
};
use crate::error::ErrorKind;
use crate::rtc::{collect_candidates, PeerTransport, PeerTransportFactory, TransportError};
use crate::signaling::protocol::{
    ConnectParams, ConnectResult, GetServerInfoParams, NegotiationPayload, PollParams,
    PollResult, RelayErrorCode, ServerInfo, SignedAnswer, METHOD_CONNECT,
    METHOD_GET_SERVER_INFO, METHOD_POLL,
};
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingError};

/// Connection errors
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("A connection attempt is already active")]
    AlreadyActive,

    #[error("Signaling failed: {0}")]
    Signaling(SignalingError),

    #[error("Server is offline")]
    AgentOffline,

    #[error("Server has no challenge available, retry shortly")]
    ChallengeUnavailable,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid answer signature: {0}")]
    InvalidSignature(String),

    #[error("Coordinator rejected the request: {0}")]
    Rejected(crate::signaling::RelayError),

    #[error("No answer after {attempts} polls")]
    PollTimeout { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Transport did not open within {0:?}")]
    TransportOpenTimeout(Duration),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Connection attempt cancelled")]
    Cancelled,
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Signaling(SignalingError::Decode(_)) | Self::InvalidResponse(_) => {
                ErrorKind::Protocol
            }
            Self::Signaling(_)
            | Self::PollTimeout { .. }
            | Self::Transport(_)
            | Self::TransportOpenTimeout(_)
            | Self::Cancelled => ErrorKind::Transport,
            Self::AgentOffline | Self::AuthenticationFailed | Self::InvalidSignature(_) => {
                ErrorKind::Authentication
            }
            Self::Rejected(e) => match e.code {
                RelayErrorCode::RegistryFull | RelayErrorCode::NotFound => ErrorKind::Resource,
                _ => ErrorKind::Protocol,
            },
            Self::ChallengeUnavailable => ErrorKind::Resource,
            Self::AlreadyActive => ErrorKind::Protocol,
        }
    }

    /// Whether retrying the whole attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::ChallengeUnavailable => true,
            other => other.kind().is_retryable(),
        }
    }
}

impl From<SignalingError> for ConnectError {
    fn from(e: SignalingError) -> Self {
        match e {
            SignalingError::Remote(relay) => match relay.code {
                RelayErrorCode::AuthFailed => Self::AuthenticationFailed,
                RelayErrorCode::Offline => Self::AgentOffline,
                _ => Self::Rejected(relay),
            },
            other => Self::Signaling(other),
        }
    }
}

impl From<TransportError> for ConnectError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// What to connect to and how to prove it
pub struct ConnectOptions {
    /// The agent's key as handed out by the operator; the trust anchor
    pub server_public_key: String,
    pub password: Zeroizing<String>,
    /// Require this algorithm instead of accepting the one the answer names
    pub signature_algorithm: Option<SignatureAlgorithm>,
}

impl ConnectOptions {
    pub fn new(server_public_key: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server_public_key: server_public_key.into(),
            password: Zeroizing::new(password.into()),
            signature_algorithm: None,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("server_public_key", &key_fingerprint(&self.server_public_key))
            .field("signature_algorithm", &self.signature_algorithm)
            .finish_non_exhaustive()
    }
}

/// Resources one attempt holds; released on every exit path.
#[derive(Default)]
struct Attempt {
    signaling: Option<Arc<dyn SignalingChannel>>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl Attempt {
    async fn release_signaling(&mut self) {
        if let Some(signaling) = self.signaling.take() {
            signaling.close().await;
        }
    }

    async fn release_all(&mut self) {
        self.release_signaling().await;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        // Only reached with resources left when the attempt was abandoned
        let signaling = self.signaling.take();
        let transport = self.transport.take();
        if signaling.is_none() && transport.is_none() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(signaling) = signaling {
                    signaling.close().await;
                }
                if let Some(transport) = transport {
                    transport.close().await;
                }
            });
        }
    }
}

const ABANDONED: &str = "Connection attempt abandoned";

/// Reverts `Connecting` to `Disconnected` unless disarmed.
///
/// Armed for the whole attempt so a dropped `connect` future does not leave
/// the connection stuck in `Connecting`.
struct ConnectingGuard {
    state: Arc<Mutex<ConnectionStateMachine>>,
    events: Arc<EventBus>,
    armed: bool,
}

impl ConnectingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let changed = {
            let mut sm = self.state.lock();
            sm.state() == ConnectionState::Connecting && sm.fail(ABANDONED.to_string())
        };
        if changed {
            debug!("[client] attempt dropped while connecting");
            self.events.emit(&ConnectionEvent::StateChanged {
                from: ConnectionState::Connecting,
                to: ConnectionState::Disconnected,
            });
            self.events.emit(&ConnectionEvent::Disconnected {
                reason: Some(ABANDONED.to_string()),
            });
        }
    }
}

type MuxSlot = Arc<Mutex<Option<Arc<ChannelMultiplexer>>>>;

/// Follows the transport of a live connection.
struct TransportWatch {
    transport: Arc<dyn PeerTransport>,
    mux: Arc<ChannelMultiplexer>,
    slot: MuxSlot,
    state: Arc<Mutex<ConnectionStateMachine>>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

impl TransportWatch {
    async fn run(self) {
        let cause = tokio::select! {
            cause = self.transport.closed() => cause,
            _ = self.cancel.cancelled() => return,
        };

        // Only act for the connection this watcher was started for
        let ours = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, &self.mux) => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };
        if !ours {
            return;
        }

        let reason = format!("Transport lost: {}", cause);
        warn!("[client] {}", reason);
        self.mux.close().await;
        let changed = self.state.lock().fail(reason.clone());
        if changed {
            self.events.emit(&ConnectionEvent::StateChanged {
                from: ConnectionState::Connected,
                to: ConnectionState::Disconnected,
            });
            self.events.emit(&ConnectionEvent::Disconnected {
                reason: Some(reason),
            });
        }
    }
}

/// Client connection to one agent
pub struct Connection {
    config: ClientConfig,
    connector: Arc<dyn SignalingConnector>,
    transports: Arc<dyn PeerTransportFactory>,
    state: Arc<Mutex<ConnectionStateMachine>>,
    events: Arc<EventBus>,
    mux: MuxSlot,
    cancel: Mutex<CancellationToken>,
}

impl Connection {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn SignalingConnector>,
        transports: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        Self {
            config,
            connector,
            transports,
            state: Arc::new(Mutex::new(ConnectionStateMachine::new())),
            events: Arc::new(EventBus::new()),
            mux: Arc::new(Mutex::new(None)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state()
    }

    /// Error that ended the most recent failed attempt
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error().map(str::to_string)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Multiplexer of the live connection
    pub fn multiplexer(&self) -> Option<Arc<ChannelMultiplexer>> {
        self.mux.lock().clone()
    }

    fn emit_transition(&self, from: ConnectionState, to: ConnectionState) {
        if from != to {
            self.events.emit(&ConnectionEvent::StateChanged { from, to });
        }
    }

    /// Run one connection attempt.
    pub async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<Arc<ChannelMultiplexer>, ConnectError> {
        {
            let mut sm = self.state.lock();
            sm.start_connecting()
                .map_err(|_| ConnectError::AlreadyActive)?;
        }
        self.emit_transition(ConnectionState::Disconnected, ConnectionState::Connecting);
        let mut guard = ConnectingGuard {
            state: self.state.clone(),
            events: self.events.clone(),
            armed: true,
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let mut attempt = Attempt::default();
        let outcome = tokio::select! {
            result = self.establish(&options, &mut attempt) => result,
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        };

        match outcome {
            Ok(transport) => {
                let mux = Arc::new(ChannelMultiplexer::new(
                    transport.clone(),
                    MuxConfig {
                        channel_open_timeout: self.config.channel_open_timeout(),
                        request_timeout: self.config.control_request_timeout(),
                    },
                ));
                let promoted = {
                    let mut sm = self.state.lock();
                    sm.connect_success().is_ok()
                };
                guard.disarm();
                if !promoted {
                    // disconnect() won the race
                    mux.close().await;
                    return Err(ConnectError::Cancelled);
                }
                *self.mux.lock() = Some(mux.clone());
                info!(
                    "[client] connected to {}",
                    key_fingerprint(&options.server_public_key)
                );
                self.emit_transition(ConnectionState::Connecting, ConnectionState::Connected);
                self.events.emit(&ConnectionEvent::Connected);
                tokio::spawn(
                    TransportWatch {
                        transport,
                        mux: mux.clone(),
                        slot: self.mux.clone(),
                        state: self.state.clone(),
                        events: self.events.clone(),
                        cancel: cancel.clone(),
                    }
                    .run(),
                );
                Ok(mux)
            }
            Err(e) => {
                attempt.release_all().await;
                warn!("[client] connection attempt failed: {}", e);
                let changed = self.state.lock().fail(e.to_string());
                guard.disarm();
                if changed {
                    self.emit_transition(
                        ConnectionState::Connecting,
                        ConnectionState::Disconnected,
                    );
                }
                if !matches!(e, ConnectError::Cancelled) {
                    self.events.emit(&ConnectionEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                if changed {
                    self.events.emit(&ConnectionEvent::Disconnected {
                        reason: Some(e.to_string()),
                    });
                }
                Err(e)
            }
        }
    }

    /// Cancel a running attempt or close the live connection. Idempotent.
    pub async fn disconnect(&self) {
        self.cancel.lock().cancel();
        let mux = self.mux.lock().take();
        if let Some(mux) = mux {
            mux.close().await;
        }
        let (changed, from) = {
            let mut sm = self.state.lock();
            let from = sm.state();
            (sm.disconnect(), from)
        };
        if changed {
            self.emit_transition(from, ConnectionState::Disconnected);
            self.events
                .emit(&ConnectionEvent::Disconnected { reason: None });
            info!("[client] disconnected");
        }
    }

    async fn establish(
        &self,
        options: &ConnectOptions,
        attempt: &mut Attempt,
    ) -> Result<Arc<dyn PeerTransport>, ConnectError> {
        let request_timeout = self.config.request_timeout();

        // 1. Signaling
        let signaling: Arc<dyn SignalingChannel> = Arc::from(
            self.connector
                .open(
                    &self.config.coordinator_url,
                    self.config.signaling_open_timeout(),
                )
                .await?,
        );
        attempt.signaling = Some(signaling.clone());
        let signaling = &*signaling;

        // 2. Status + fresh challenge
        let info: ServerInfo = call(
            signaling,
            METHOD_GET_SERVER_INFO,
            &GetServerInfoParams {
                server_public_key: options.server_public_key.clone(),
            },
            request_timeout,
        )
        .await?;
        if !info.online {
            return Err(ConnectError::AgentOffline);
        }
        let nonce = info.challenge.ok_or(ConnectError::ChallengeUnavailable)?;

        // 3. The password does not leave this step
        let challenge_answer = compute_answer(&nonce, &options.password);

        // 4. Offer + bounded candidate gathering
        let transport = self.transports.create().await?;
        attempt.transport = Some(transport.clone());
        let mut offer = transport.create_offer().await?;
        let candidates =
            collect_candidates(&mut offer.candidates, self.config.ice_gathering_timeout()).await;
        debug!("[client] offer ready with {} candidates", candidates.len());

        // 5. Submit
        let session: ConnectResult = call(
            signaling,
            METHOD_CONNECT,
            &ConnectParams {
                server_public_key: options.server_public_key.clone(),
                challenge_answer,
                payload: NegotiationPayload {
                    sdp: offer.sdp,
                    candidates,
                },
            },
            request_timeout,
        )
        .await?;
        debug!("[client] session {} created", session.session_id);

        // 6. Wait for the answer
        let answer = self
            .poll_answer(signaling, &session.session_id, request_timeout)
            .await?;

        // 7. Verify against the operator-supplied key
        verify_answer(options, &session.session_id, &answer)?;

        // 8. Hand off to the direct transport
        transport.apply_answer(&answer.payload).await?;
        let open_timeout = self.config.transport_open_timeout();
        match tokio::time::timeout(open_timeout, transport.wait_connected()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectError::TransportOpenTimeout(open_timeout)),
        }

        // 9. Signaling is no longer needed
        attempt.release_signaling().await;
        attempt.transport = None;
        Ok(transport)
    }

    async fn poll_answer(
        &self,
        signaling: &dyn SignalingChannel,
        session_id: &str,
        request_timeout: Duration,
    ) -> Result<SignedAnswer, ConnectError> {
        let attempts = self.config.poll_max_attempts;
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        for n in 1..=attempts {
            ticker.tick().await;
            let result: PollResult = call(
                signaling,
                METHOD_POLL,
                &PollParams {
                    session_id: session_id.to_string(),
                    last_update: None,
                },
                request_timeout,
            )
            .await?;
            if result.success {
                return result.payload.ok_or_else(|| {
                    ConnectError::InvalidResponse("poll succeeded without payload".into())
                });
            }
            debug!("[client] poll {}/{}: not ready", n, attempts);
        }
        Err(ConnectError::PollTimeout { attempts })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
    }
}

/// Typed signaling call.
async fn call<P: Serialize, R: DeserializeOwned>(
    signaling: &dyn SignalingChannel,
    method: &str,
    params: &P,
    timeout: Duration,
) -> Result<R, ConnectError> {
    let params = serde_json::to_value(params)
        .map_err(|e| ConnectError::Signaling(SignalingError::Encode(e.to_string())))?;
    let data = signaling.request(method, params, timeout).await?;
    serde_json::from_value(data)
        .map_err(|e| ConnectError::Signaling(SignalingError::Decode(e.to_string())))
}

/// Check the answer is for our session, from our agent, and correctly signed.
fn verify_answer(
    options: &ConnectOptions,
    session_id: &str,
    answer: &SignedAnswer,
) -> Result<(), ConnectError> {
    if answer.session_id != session_id {
        return Err(ConnectError::InvalidSignature(
            "answer is for another session".into(),
        ));
    }

    let trusted = normalize_public_key(&options.server_public_key)
        .map_err(|e| ConnectError::InvalidSignature(e.to_string()))?;
    let claimed = normalize_public_key(&answer.server_public_key)
        .map_err(|e| ConnectError::InvalidSignature(e.to_string()))?;
    if trusted != claimed {
        return Err(ConnectError::InvalidSignature(
            "answer names a different server key".into(),
        ));
    }

    if let Some(required) = options.signature_algorithm {
        if required != answer.signature_algorithm {
            return Err(ConnectError::InvalidSignature(format!(
                "expected {}, got {}",
                required, answer.signature_algorithm
            )));
        }
    }

    match verify(
        &answer.statement(),
        &answer.signature,
        &trusted,
        answer.signature_algorithm,
    ) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ConnectError::InvalidSignature(
            "signature does not verify".into(),
        )),
        Err(e) => Err(ConnectError::InvalidSignature(e.to_string())),
    }
}
