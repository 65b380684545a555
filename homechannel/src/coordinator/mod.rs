//! Coordinator - the public relay
//!
//! Holds the agent registry, the session store and the challenge ledger, and
//! serves two paths that share them:
//!
//! ```text
//!  agents ──UDP──► udp::serve_agents ─┐
//!                                     ├──► Coordinator (registry, sessions, challenges)
//!  clients ──WS──► server::serve ─────┘            ▲
//!                                                  └── sweeper (evict / purge)
//! ```
//!
//! The coordinator never terminates the application protocol; it only relays
//! the negotiation and authenticates the client against agent-supplied digests.

pub mod challenges;
pub mod datagram;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::crypto::{digests_match, key_fingerprint, normalize_public_key, verify, SignatureAlgorithm};
use crate::signaling::protocol::{
    ConnectParams, ConnectResult, GetServerInfoParams, PollParams, PollResult, RelayError,
    RelayErrorCode, ServerInfo, METHOD_CONNECT, METHOD_GET_SERVER_INFO, METHOD_POLL,
};

pub use challenges::{ClientId, IssuedChallenges};
pub use datagram::{AgentDatagram, AnswerStatus, CoordinatorDatagram, PresenceKind, PresenceStatement};
pub use registry::{AgentRecord, AgentRegistry, RegistryError};
pub use sessions::{PollOutcome, SessionState, SessionStore};

/// Capacity of the outbound datagram queue.
const OUTBOUND_QUEUE: usize = 1024;

/// A datagram queued for delivery to an agent
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: SocketAddr,
    pub datagram: CoordinatorDatagram,
}

/// Shared coordinator state
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: AgentRegistry,
    sessions: SessionStore,
    challenges: IssuedChallenges,
    outbound_tx: mpsc::Sender<Outbound>,
}

impl Coordinator {
    /// Create the coordinator and the receiving end of its outbound queue.
    pub fn new(config: CoordinatorConfig) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let coordinator = Self {
            registry: AgentRegistry::new(config.max_servers, config.server_timeout()),
            sessions: SessionStore::new(config.session_ttl()),
            challenges: IssuedChallenges::new(config.challenge_ttl()),
            outbound_tx,
            config,
        };
        (coordinator, outbound_rx)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn challenges(&self) -> &IssuedChallenges {
        &self.challenges
    }

    fn enqueue(&self, to: SocketAddr, datagram: CoordinatorDatagram) {
        if let Err(e) = self.outbound_tx.try_send(Outbound { to, datagram }) {
            // Agents recover through keepalive redelivery
            warn!("[coordinator] outbound queue rejected datagram to {}: {}", to, e);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client-facing relay operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Report whether an agent is online and hand out one challenge for it.
    pub fn get_server_info(
        &self,
        client: ClientId,
        params: GetServerInfoParams,
    ) -> Result<ServerInfo, RelayError> {
        let key = normalize_public_key(&params.server_public_key)
            .map_err(|_| RelayError::invalid_request("Malformed server public key"))?;

        if self.registry.lookup(&key).is_none() {
            return Ok(ServerInfo {
                online: false,
                challenge: None,
            });
        }

        let challenge = self.registry.take_challenge(&key).map(|pair| {
            let nonce = pair.nonce.clone();
            self.challenges.issue(client, &key, pair);
            nonce
        });
        if challenge.is_none() {
            debug!(
                "[coordinator] agent {} has no unissued challenge",
                key_fingerprint(&key)
            );
        }

        Ok(ServerInfo {
            online: true,
            challenge,
        })
    }

    /// Authenticate the client and, on success, open a session and relay the
    /// offer to the agent.
    pub fn connect(
        &self,
        client: ClientId,
        params: ConnectParams,
    ) -> Result<ConnectResult, RelayError> {
        let key = normalize_public_key(&params.server_public_key)
            .map_err(|_| RelayError::invalid_request("Malformed server public key"))?;

        let agent = self.registry.lookup(&key).ok_or_else(RelayError::offline)?;

        // Consumed whether or not the answer matches
        let Some(pair) = self.challenges.consume(client, &key) else {
            info!(
                "[coordinator] connect without outstanding challenge for {}",
                key_fingerprint(&key)
            );
            return Err(RelayError::auth_failed());
        };

        if !digests_match(&pair.answer_digest, &params.challenge_answer) {
            info!(
                "[coordinator] challenge answer rejected for {}",
                key_fingerprint(&key)
            );
            return Err(RelayError::auth_failed());
        }

        let session_id = self.sessions.create_session(
            &key,
            params.payload.clone(),
            pair.nonce.clone(),
            params.challenge_answer.clone(),
        );

        self.enqueue(
            agent.transport_address,
            CoordinatorDatagram::Offer {
                session_id: session_id.clone(),
                payload: params.payload,
                challenge: pair.nonce,
                challenge_answer: params.challenge_answer,
            },
        );

        Ok(ConnectResult { session_id })
    }

    /// Return the signed answer once the agent has produced it.
    pub fn poll(&self, params: PollParams) -> PollResult {
        match self.sessions.poll(&params.session_id, params.last_update) {
            PollOutcome::Ready(answer) => PollResult::ready(answer),
            PollOutcome::NotReady => PollResult::pending(),
        }
    }

    /// Route one signaling request by method name.
    pub fn dispatch(
        &self,
        client: ClientId,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError> {
        match method {
            METHOD_GET_SERVER_INFO => {
                let params = parse_params(params)?;
                to_value(self.get_server_info(client, params)?)
            }
            METHOD_CONNECT => {
                let params = parse_params(params)?;
                to_value(self.connect(client, params)?)
            }
            METHOD_POLL => {
                let params = parse_params(params)?;
                to_value(self.poll(params))
            }
            other => Err(RelayError::new(
                RelayErrorCode::UnknownMethod,
                format!("Unknown method: {}", other),
            )),
        }
    }

    /// A signaling client went away.
    pub fn client_closed(&self, client: ClientId) {
        self.challenges.forget_client(client);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Agent-facing datagram path
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle one datagram from an agent, returning the replies for `from`.
    pub fn handle_agent_datagram(
        &self,
        from: SocketAddr,
        datagram: AgentDatagram,
    ) -> Vec<CoordinatorDatagram> {
        match datagram {
            AgentDatagram::Register { .. } | AgentDatagram::Keepalive { .. } => {
                self.handle_presence(from, datagram)
            }
            AgentDatagram::Answer { mut answer } => {
                let session_id = answer.session_id.clone();
                let status = match normalize_public_key(&answer.server_public_key) {
                    Ok(key) => {
                        answer.server_public_key = key;
                        self.sessions.record_answer(answer)
                    }
                    Err(_) => AnswerStatus::NotFound,
                };
                vec![CoordinatorDatagram::AnswerAck { session_id, status }]
            }
        }
    }

    /// `register` / `keepalive`: verify the statement, then update the registry.
    ///
    /// Nothing in the registry changes for a datagram that fails verification.
    fn handle_presence(&self, from: SocketAddr, datagram: AgentDatagram) -> Vec<CoordinatorDatagram> {
        let Some((statement, signature)) = datagram.presence() else {
            return Vec::new();
        };
        let key = match normalize_public_key(statement.public_key) {
            Ok(k) => k,
            Err(e) => {
                return vec![CoordinatorDatagram::Rejected {
                    reason: e.to_string(),
                }]
            }
        };
        let algorithm = match &datagram {
            AgentDatagram::Register {
                signature_algorithm,
                ..
            } => *signature_algorithm,
            _ => match self.registry.algorithm_of(&key) {
                Some(algorithm) => algorithm,
                None => return vec![CoordinatorDatagram::Unknown],
            },
        };
        if let Err(reason) = self.check_presence(&statement, signature, algorithm) {
            warn!(
                "[coordinator] {:?} for {} from {} refused: {}",
                statement.kind,
                key_fingerprint(&key),
                from,
                reason
            );
            return vec![CoordinatorDatagram::Rejected {
                reason: reason.to_string(),
            }];
        }
        let timestamp = statement.timestamp;

        let result = match datagram {
            AgentDatagram::Register {
                signature_algorithm,
                challenges,
                ..
            } => self
                .registry
                .register(key.clone(), signature_algorithm, from, timestamp, challenges)
                .map(|()| CoordinatorDatagram::Registered {
                    server_timeout_secs: self.config.server_timeout_secs,
                }),
            AgentDatagram::Keepalive { challenges, .. } => self
                .registry
                .keepalive(&key, from, timestamp, challenges)
                .map(|()| CoordinatorDatagram::KeepaliveAck),
            AgentDatagram::Answer { .. } => return Vec::new(),
        };

        match result {
            Ok(ack) => {
                let mut replies = vec![ack];
                replies.extend(self.pending_offers(&key));
                replies
            }
            Err(RegistryError::Unknown) => vec![CoordinatorDatagram::Unknown],
            Err(e) => {
                warn!("[coordinator] datagram from {} refused: {}", from, e);
                vec![CoordinatorDatagram::Rejected {
                    reason: e.to_string(),
                }]
            }
        }
    }

    fn check_presence(
        &self,
        statement: &PresenceStatement<'_>,
        signature: &str,
        algorithm: SignatureAlgorithm,
    ) -> Result<(), &'static str> {
        let skew = chrono::Utc::now()
            .timestamp_millis()
            .abs_diff(statement.timestamp);
        if u128::from(skew) > self.config.max_clock_skew().as_millis() {
            return Err("Timestamp outside the accepted clock skew");
        }
        match verify(statement, signature, statement.public_key, algorithm) {
            Ok(true) => Ok(()),
            _ => Err("Invalid signature"),
        }
    }

    fn pending_offers(&self, key: &str) -> Vec<CoordinatorDatagram> {
        self.sessions
            .pending_for_agent(key)
            .into_iter()
            .map(|p| CoordinatorDatagram::Offer {
                session_id: p.session_id,
                payload: p.offer,
                challenge: p.challenge,
                challenge_answer: p.challenge_answer,
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Background maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// One maintenance pass: evict silent agents, purge expired sessions and
    /// challenges.
    pub fn sweep(&self) {
        let evicted = self.registry.evict_expired();
        let purged = self.sessions.purge_expired();
        let challenges = self.challenges.purge_expired();
        if evicted + purged + challenges > 0 {
            debug!(
                "[coordinator] sweep: evicted={}, sessions={}, challenges={}",
                evicted, purged, challenges
            );
        }
    }

    /// Run [`Coordinator::sweep`] every `sweep_interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("[coordinator] sweeper stopped");
        })
    }

    /// Bind both listeners and serve until `shutdown` fires.
    pub async fn run(
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        let socket = tokio::net::UdpSocket::bind(config.agent_addr).await?;
        let listener = tokio::net::TcpListener::bind(config.signaling_addr).await?;
        info!(
            "[coordinator] agents on udp://{}, clients on ws://{}",
            socket.local_addr()?,
            listener.local_addr()?
        );

        let (coordinator, outbound_rx) = Coordinator::new(config);
        let coordinator = Arc::new(coordinator);

        let sweeper = coordinator.spawn_sweeper(shutdown.clone());
        let agents = tokio::spawn(udp::serve_agents(
            socket,
            coordinator.clone(),
            outbound_rx,
            shutdown.clone(),
        ));
        let clients = tokio::spawn(server::serve(listener, coordinator.clone(), shutdown.clone()));

        shutdown.cancelled().await;
        for handle in [sweeper, agents, clients] {
            let _ = handle.await;
        }
        info!("[coordinator] stopped");
        Ok(())
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: serde_json::Value,
) -> Result<T, RelayError> {
    serde_json::from_value(params).map_err(|e| RelayError::invalid_request(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, RelayError> {
    serde_json::to_value(value)
        .map_err(|_| RelayError::new(RelayErrorCode::Internal, "Internal error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identity::AgentIdentity;
    use crate::crypto::{compute_answer, ChallengeAuthenticator, ChallengePair};
    use crate::signaling::protocol::{AnswerStatement, NegotiationPayload, SignedAnswer};
    use serde_json::json;
    use std::time::Duration;

    const AGENT_ADDR: ([u8; 4], u16) = ([10, 0, 0, 2], 4000);
    const FORGER_ADDR: ([u8; 4], u16) = ([203, 0, 113, 9], 6666);

    /// Current time, strictly increasing across calls
    fn now_ms() -> i64 {
        static BUMP: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);
        chrono::Utc::now().timestamp_millis()
            + BUMP.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn presence(
        identity: &AgentIdentity,
        kind: PresenceKind,
        challenges: Vec<ChallengePair>,
    ) -> AgentDatagram {
        identity.presence(kind, now_ms(), challenges).unwrap()
    }

    struct Fixture {
        coordinator: Coordinator,
        outbound: mpsc::Receiver<Outbound>,
        identity: AgentIdentity,
        auth: ChallengeAuthenticator,
    }

    fn fixture() -> Fixture {
        let (coordinator, outbound) = Coordinator::new(CoordinatorConfig::default());
        let identity = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let auth = ChallengeAuthenticator::new("correct-password", Duration::from_secs(120));
        let replies = coordinator.handle_agent_datagram(
            AGENT_ADDR.into(),
            presence(&identity, PresenceKind::Register, auth.issue_batch(4)),
        );
        assert!(matches!(
            replies[0],
            CoordinatorDatagram::Registered { .. }
        ));
        Fixture {
            coordinator,
            outbound,
            identity,
            auth,
        }
    }

    fn offer() -> NegotiationPayload {
        NegotiationPayload {
            sdp: "offer".into(),
            candidates: vec![],
        }
    }

    fn info(f: &Fixture, client: ClientId) -> ServerInfo {
        f.coordinator
            .get_server_info(
                client,
                GetServerInfoParams {
                    server_public_key: f.identity.public_key(),
                },
            )
            .unwrap()
    }

    fn connect(f: &Fixture, client: ClientId, answer: String) -> Result<ConnectResult, RelayError> {
        f.coordinator.connect(
            client,
            ConnectParams {
                server_public_key: f.identity.public_key(),
                challenge_answer: answer,
                payload: offer(),
            },
        )
    }

    fn signed_answer(f: &Fixture, session_id: &str) -> SignedAnswer {
        let statement = AnswerStatement {
            server_public_key: f.identity.public_key(),
            session_id: session_id.into(),
            timestamp: 42,
            payload: NegotiationPayload {
                sdp: "answer".into(),
                candidates: vec![],
            },
        };
        let signature = f.identity.sign(&statement).unwrap();
        SignedAnswer {
            server_public_key: statement.server_public_key,
            session_id: statement.session_id,
            timestamp: statement.timestamp,
            payload: statement.payload,
            signature,
            signature_algorithm: SignatureAlgorithm::Ed25519,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_agent() {
        let (coordinator, _rx) = Coordinator::new(CoordinatorConfig::default());
        let identity = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let info = coordinator
            .get_server_info(
                1,
                GetServerInfoParams {
                    server_public_key: identity.public_key(),
                },
            )
            .unwrap();
        assert_eq!(
            info,
            ServerInfo {
                online: false,
                challenge: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_relay_flow() {
        let mut f = fixture();
        let info = info(&f, 1);
        assert!(info.online);
        let nonce = info.challenge.unwrap();
        assert_eq!(nonce.len(), 64);

        let result = connect(&f, 1, compute_answer(&nonce, "correct-password")).unwrap();

        // The offer is relayed with the challenge for agent-side re-verification
        let out = f.outbound.try_recv().unwrap();
        assert_eq!(out.to, AGENT_ADDR.into());
        match out.datagram {
            CoordinatorDatagram::Offer {
                session_id,
                challenge,
                challenge_answer,
                ..
            } => {
                assert_eq!(session_id, result.session_id);
                assert!(f.auth.verify_answer(&challenge, &challenge_answer));
            }
            other => panic!("Expected Offer, got {:?}", other),
        }

        let pending = f.coordinator.poll(PollParams {
            session_id: result.session_id.clone(),
            last_update: None,
        });
        assert!(!pending.success);

        let replies = f.coordinator.handle_agent_datagram(
            AGENT_ADDR.into(),
            AgentDatagram::Answer {
                answer: signed_answer(&f, &result.session_id),
            },
        );
        assert!(matches!(
            replies[0],
            CoordinatorDatagram::AnswerAck {
                status: AnswerStatus::Recorded,
                ..
            }
        ));

        let ready = f.coordinator.poll(PollParams {
            session_id: result.session_id,
            last_update: None,
        });
        assert!(ready.success);
        assert_eq!(ready.payload.unwrap().payload.sdp, "answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_password_creates_no_session() {
        let mut f = fixture();
        let nonce = info(&f, 1).challenge.unwrap();
        let err = connect(&f, 1, compute_answer(&nonce, "wrong-password")).unwrap_err();
        assert_eq!(err.code, RelayErrorCode::AuthFailed);
        assert_eq!(f.coordinator.sessions().count(), 0);
        assert!(f.outbound.try_recv().is_err());

        // The challenge was consumed by the failed attempt
        let err = connect(&f, 1, compute_answer(&nonce, "correct-password")).unwrap_err();
        assert_eq!(err.code, RelayErrorCode::AuthFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_bound_to_client() {
        let f = fixture();
        let nonce = info(&f, 1).challenge.unwrap();
        let err = connect(&f, 2, compute_answer(&nonce, "correct-password")).unwrap_err();
        assert_eq!(err.code, RelayErrorCode::AuthFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_info_request_gets_fresh_nonce() {
        let f = fixture();
        let a = info(&f, 1).challenge.unwrap();
        let b = info(&f, 2).challenge.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_offline_agent() {
        let f = fixture();
        tokio::time::advance(Duration::from_secs(61)).await;
        let err = connect(&f, 1, "00".into()).unwrap_err();
        assert_eq!(err.code, RelayErrorCode::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_redelivers_pending_offers() {
        let f = fixture();
        let nonce = info(&f, 1).challenge.unwrap();
        let session = connect(&f, 1, compute_answer(&nonce, "correct-password")).unwrap();

        let replies = f.coordinator.handle_agent_datagram(
            AGENT_ADDR.into(),
            presence(&f.identity, PresenceKind::Keepalive, vec![]),
        );
        assert!(matches!(replies[0], CoordinatorDatagram::KeepaliveAck));
        assert!(replies.iter().any(|r| matches!(
            r,
            CoordinatorDatagram::Offer { session_id, .. } if *session_id == session.session_id
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_from_unknown_agent() {
        let (coordinator, _rx) = Coordinator::new(CoordinatorConfig::default());
        let identity = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let replies = coordinator.handle_agent_datagram(
            AGENT_ADDR.into(),
            presence(&identity, PresenceKind::Keepalive, vec![]),
        );
        assert!(matches!(replies[0], CoordinatorDatagram::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_keepalive_leaves_record_unchanged() {
        let mut f = fixture();
        let forger = AgentIdentity::generate(SignatureAlgorithm::Ed25519);

        // Claims the victim's key but is signed with another one
        let forged = match presence(&forger, PresenceKind::Keepalive, vec![]) {
            AgentDatagram::Keepalive {
                timestamp,
                challenges,
                signature,
                ..
            } => AgentDatagram::Keepalive {
                public_key: f.identity.public_key(),
                timestamp,
                challenges,
                signature,
            },
            other => panic!("Expected Keepalive, got {:?}", other),
        };
        let replies = f
            .coordinator
            .handle_agent_datagram(FORGER_ADDR.into(), forged);
        assert!(matches!(replies[..], [CoordinatorDatagram::Rejected { .. }]));

        // A genuine keepalive replayed from elsewhere is refused as well
        let genuine = presence(&f.identity, PresenceKind::Keepalive, vec![]);
        f.coordinator
            .handle_agent_datagram(AGENT_ADDR.into(), genuine.clone());
        let replies = f
            .coordinator
            .handle_agent_datagram(FORGER_ADDR.into(), genuine);
        assert!(matches!(replies[..], [CoordinatorDatagram::Rejected { .. }]));

        let record = f
            .coordinator
            .registry()
            .lookup(&f.identity.public_key())
            .unwrap();
        assert_eq!(record.transport_address, AGENT_ADDR.into());

        // Offers still go to the real agent
        let nonce = info(&f, 1).challenge.unwrap();
        connect(&f, 1, compute_answer(&nonce, "correct-password")).unwrap();
        assert_eq!(f.outbound.try_recv().unwrap().to, AGENT_ADDR.into());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_register_cannot_replace_pool() {
        let f = fixture();
        let forger = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let forged_pool = ChallengeAuthenticator::new("attacker", Duration::from_secs(120));

        let forged = match presence(&forger, PresenceKind::Register, forged_pool.issue_batch(4)) {
            AgentDatagram::Register {
                signature_algorithm,
                timestamp,
                challenges,
                signature,
                ..
            } => AgentDatagram::Register {
                public_key: f.identity.public_key(),
                signature_algorithm,
                timestamp,
                challenges,
                signature,
            },
            other => panic!("Expected Register, got {:?}", other),
        };
        let replies = f
            .coordinator
            .handle_agent_datagram(FORGER_ADDR.into(), forged);
        assert!(matches!(replies[..], [CoordinatorDatagram::Rejected { .. }]));

        let nonce = info(&f, 1).challenge.unwrap();
        assert!(f.auth.verify_answer(&nonce, &compute_answer(&nonce, "correct-password")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_statement_rejected() {
        let (coordinator, _rx) = Coordinator::new(CoordinatorConfig::default());
        let identity = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let an_hour_ago = chrono::Utc::now().timestamp_millis() - 3_600_000;
        let stale = identity
            .presence(PresenceKind::Register, an_hour_ago, vec![])
            .unwrap();
        let replies = coordinator.handle_agent_datagram(AGENT_ADDR.into(), stale);
        assert!(matches!(replies[..], [CoordinatorDatagram::Rejected { .. }]));
        assert_eq!(coordinator.registry().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_errors() {
        let f = fixture();
        let err = f.coordinator.dispatch(1, "launch", json!({})).unwrap_err();
        assert_eq!(err.code, RelayErrorCode::UnknownMethod);

        let err = f
            .coordinator
            .dispatch(1, METHOD_CONNECT, json!({"serverPublicKey": 5}))
            .unwrap_err();
        assert_eq!(err.code, RelayErrorCode::InvalidRequest);

        // Unknown session polls are never an error
        let value = f
            .coordinator
            .dispatch(1, METHOD_POLL, json!({"sessionId": "nope"}))
            .unwrap();
        assert_eq!(value, json!({"success": false}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_and_purges() {
        let f = fixture();
        let nonce = info(&f, 1).challenge.unwrap();
        connect(&f, 1, compute_answer(&nonce, "correct-password")).unwrap();
        info(&f, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        f.coordinator.sweep();
        assert_eq!(f.coordinator.registry().count(), 0);
        assert_eq!(f.coordinator.sessions().count(), 0);
        assert_eq!(f.coordinator.challenges().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_closed_drops_challenges() {
        let f = fixture();
        info(&f, 7);
        assert_eq!(f.coordinator.challenges().count(), 1);
        f.coordinator.client_closed(7);
        assert_eq!(f.coordinator.challenges().count(), 0);
    }
}
