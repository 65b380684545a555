//! Session Store - in-flight connection negotiations
//!
//! Lifecycle of one session:
//!
//! ```text
//! create_session ──► AwaitingAnswer ──record_answer──► Answered ──poll──► (deleted)
//!                          │                              │
//!                          └────────── ttl ───────────────┴──► Expired ──► (purged)
//! ```
//!
//! States only move forward, at most one answer is ever recorded, and a
//! successful poll consumes the session.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::signaling::protocol::{NegotiationPayload, SignedAnswer};

use super::datagram::AnswerStatus;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingAnswer,
    Answered,
    Expired,
}

/// One negotiation between a client and an agent
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub agent_public_key: String,
    pub offer: NegotiationPayload,
    /// Challenge consumed to create this session; forwarded with the offer
    pub challenge: String,
    pub challenge_answer: String,
    pub answer: Option<SignedAnswer>,
    pub created_at: Instant,
    pub state: SessionState,
}

/// An offer the agent has not answered yet
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub session_id: String,
    pub offer: NegotiationPayload,
    pub challenge: String,
    pub challenge_answer: String,
}

/// Result of a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Unknown, unanswered, expired or already consumed
    NotReady,
    Ready(SignedAnswer),
}

/// Coordinator-side table of negotiations
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    fn expire_if_due(&self, session: &mut Session, now: Instant) {
        if session.state != SessionState::Expired
            && now.saturating_duration_since(session.created_at) > self.ttl
        {
            session.state = SessionState::Expired;
        }
    }

    /// Allocate a session for an offer. Callers must have verified the
    /// client's challenge answer first.
    pub fn create_session(
        &self,
        agent_public_key: &str,
        offer: NegotiationPayload,
        challenge: String,
        challenge_answer: String,
    ) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session {
            session_id: session_id.clone(),
            agent_public_key: agent_public_key.to_string(),
            offer,
            challenge,
            challenge_answer,
            answer: None,
            created_at: Instant::now(),
            state: SessionState::AwaitingAnswer,
        };
        self.sessions.insert(session_id.clone(), session);
        info!("[sessions] session created: {}", session_id);
        session_id
    }

    /// Record the agent's answer. A session accepts exactly one answer, and
    /// only from the agent it was created for.
    pub fn record_answer(&self, answer: SignedAnswer) -> AnswerStatus {
        let now = Instant::now();
        let Some(mut entry) = self.sessions.get_mut(&answer.session_id) else {
            return AnswerStatus::NotFound;
        };
        let session = entry.value_mut();
        self.expire_if_due(session, now);

        if session.agent_public_key != answer.server_public_key {
            debug!(
                "[sessions] answer for {} from a different agent, ignoring",
                session.session_id
            );
            return AnswerStatus::NotFound;
        }

        match session.state {
            SessionState::Expired => AnswerStatus::NotFound,
            SessionState::Answered => AnswerStatus::AlreadyAnswered,
            SessionState::AwaitingAnswer => {
                session.answer = Some(answer);
                session.state = SessionState::Answered;
                info!("[sessions] session answered: {}", session.session_id);
                AnswerStatus::Recorded
            }
        }
    }

    /// Return the answer once it exists and is newer than `since`.
    ///
    /// A ready poll removes the session: there is at most one consumer.
    pub fn poll(&self, session_id: &str, since: Option<i64>) -> PollOutcome {
        let now = Instant::now();
        let ready = {
            let Some(mut entry) = self.sessions.get_mut(session_id) else {
                return PollOutcome::NotReady;
            };
            let session = entry.value_mut();
            self.expire_if_due(session, now);
            session.state == SessionState::Answered
                && session
                    .answer
                    .as_ref()
                    .is_some_and(|a| since.map_or(true, |s| a.timestamp > s))
        };

        if !ready {
            return PollOutcome::NotReady;
        }

        // Removal decides the single winner between concurrent pollers
        match self.sessions.remove(session_id) {
            Some((_, session)) => match session.answer {
                Some(answer) => {
                    info!("[sessions] session handed off: {}", session_id);
                    PollOutcome::Ready(answer)
                }
                None => PollOutcome::NotReady,
            },
            None => PollOutcome::NotReady,
        }
    }

    /// Unanswered, unexpired offers addressed to an agent.
    pub fn pending_for_agent(&self, agent_public_key: &str) -> Vec<PendingOffer> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.agent_public_key == agent_public_key
                    && s.state == SessionState::AwaitingAnswer
                    && now.saturating_duration_since(s.created_at) <= self.ttl
            })
            .map(|entry| {
                let s = entry.value();
                PendingOffer {
                    session_id: s.session_id.clone(),
                    offer: s.offer.clone(),
                    challenge: s.challenge.clone(),
                    challenge_answer: s.challenge_answer.clone(),
                }
            })
            .collect()
    }

    /// Current state of a session, if it is still held.
    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        let now = Instant::now();
        let mut entry = self.sessions.get_mut(session_id)?;
        self.expire_if_due(entry.value_mut(), now);
        Some(entry.state)
    }

    /// Remove every session older than the TTL. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.saturating_duration_since(s.created_at) <= self.ttl);
        let purged = before.saturating_sub(self.sessions.len());
        if purged > 0 {
            debug!("[sessions] purged {} expired sessions", purged);
        }
        purged
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
