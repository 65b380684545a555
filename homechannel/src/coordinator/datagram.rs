//! Agent ↔ coordinator datagrams (UDP, one JSON object per datagram)
//!
//! Agent → coordinator: `register`, `keepalive`, `answer`
//! Coordinator → agent: `registered`, `keepaliveAck`, `unknown`, `rejected`,
//! `offer`, `answerAck`
//!
//! Delivery is best-effort. Agents re-register on `unknown`, the coordinator
//! re-sends pending offers on every keepalive, and agents re-send answers
//! until an `answerAck` arrives.
//!
//! `register` and `keepalive` carry a signature over their
//! [`PresenceStatement`] and a Unix-millisecond timestamp that must increase
//! from one accepted datagram to the next.

use serde::{Deserialize, Serialize};

use crate::crypto::{ChallengePair, SignatureAlgorithm};
use crate::signaling::protocol::{NegotiationPayload, SignedAnswer};

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Agent → coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentDatagram {
    #[serde(rename_all = "camelCase")]
    Register {
        public_key: String,
        #[serde(default)]
        signature_algorithm: SignatureAlgorithm,
        timestamp: i64,
        #[serde(default)]
        challenges: Vec<ChallengePair>,
        signature: String,
    },
    #[serde(rename_all = "camelCase")]
    Keepalive {
        public_key: String,
        timestamp: i64,
        #[serde(default)]
        challenges: Vec<ChallengePair>,
        signature: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer { answer: SignedAnswer },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Register,
    Keepalive,
}

/// What an agent signs to prove a `register` or `keepalive` came from it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatement<'a> {
    pub kind: PresenceKind,
    pub public_key: &'a str,
    pub timestamp: i64,
    pub challenges: &'a [ChallengePair],
}

/// Outcome reported for a submitted answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Recorded,
    NotFound,
    AlreadyAnswered,
}

/// Coordinator → agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinatorDatagram {
    #[serde(rename_all = "camelCase")]
    Registered { server_timeout_secs: u64 },
    KeepaliveAck,
    /// The coordinator has no record of this agent; it must register again
    Unknown,
    #[serde(rename_all = "camelCase")]
    Rejected { reason: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        session_id: String,
        payload: NegotiationPayload,
        challenge: String,
        challenge_answer: String,
    },
    #[serde(rename_all = "camelCase")]
    AnswerAck {
        session_id: String,
        status: AnswerStatus,
    },
}

impl AgentDatagram {
    /// The signed statement and its signature, for `register` and `keepalive`.
    pub fn presence(&self) -> Option<(PresenceStatement<'_>, &str)> {
        match self {
            Self::Register {
                public_key,
                timestamp,
                challenges,
                signature,
                ..
            } => Some((
                PresenceStatement {
                    kind: PresenceKind::Register,
                    public_key,
                    timestamp: *timestamp,
                    challenges,
                },
                signature,
            )),
            Self::Keepalive {
                public_key,
                timestamp,
                challenges,
                signature,
            } => Some((
                PresenceStatement {
                    kind: PresenceKind::Keepalive,
                    public_key,
                    timestamp: *timestamp,
                    challenges,
                },
                signature,
            )),
            Self::Answer { .. } => None,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl CoordinatorDatagram {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let raw = json!({
            "type": "register",
            "publicKey": "AAAA",
            "signatureAlgorithm": "ecdsa-p256",
            "timestamp": 1700000000000i64,
            "challenges": [{"nonce": "ab", "answerDigest": "cd"}],
            "signature": "00"
        });
        let decoded = AgentDatagram::decode(raw.to_string().as_bytes()).unwrap();
        match decoded {
            AgentDatagram::Register {
                ref public_key,
                signature_algorithm,
                timestamp,
                ref challenges,
                ..
            } => {
                assert_eq!(public_key, "AAAA");
                assert_eq!(signature_algorithm, SignatureAlgorithm::EcdsaP256);
                assert_eq!(timestamp, 1_700_000_000_000);
                assert_eq!(challenges.len(), 1);
            }
            ref other => panic!("Expected Register, got {:?}", other),
        }

        let (statement, signature) = decoded.presence().unwrap();
        assert_eq!(signature, "00");
        assert_eq!(
            serde_json::to_value(&statement).unwrap(),
            json!({
                "kind": "register",
                "publicKey": "AAAA",
                "timestamp": 1700000000000i64,
                "challenges": [{"nonce": "ab", "answerDigest": "cd"}]
            })
        );
    }

    #[test]
    fn test_keepalive_without_challenges() {
        let decoded = AgentDatagram::decode(
            br#"{"type":"keepalive","publicKey":"AAAA","timestamp":5,"signature":"00"}"#,
        )
        .unwrap();
        assert!(matches!(
            decoded,
            AgentDatagram::Keepalive { ref challenges, .. } if challenges.is_empty()
        ));
    }

    #[test]
    fn test_unsigned_keepalive_rejected() {
        assert!(AgentDatagram::decode(br#"{"type":"keepalive","publicKey":"AAAA"}"#).is_err());
    }

    #[test]
    fn test_ack_tags() {
        let bytes = CoordinatorDatagram::KeepaliveAck.encode().unwrap();
        assert_eq!(bytes, br#"{"type":"keepaliveAck"}"#.to_vec());

        let ack = CoordinatorDatagram::AnswerAck {
            session_id: "s".into(),
            status: AnswerStatus::AlreadyAnswered,
        };
        let value: serde_json::Value = serde_json::from_slice(&ack.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "answerAck");
        assert_eq!(value["status"], "already_answered");
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(AgentDatagram::decode(br#"{"type":"launch"}"#).is_err());
    }
}
