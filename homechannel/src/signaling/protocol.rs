//! Signaling wire protocol
//!
//! Envelope (JSON text frames over the signaling channel):
//! - request:  `{"type":"request","requestId":..,"method":..,"params":..}`
//! - response: `{"type":"response","requestId":..,"data":..}`
//!   or        `{"type":"response","requestId":..,"error":{"code":..,"message":..}}`
//!
//! Responses are correlated purely by `requestId`.
//!
//! Relay methods:
//! - `getServerInfo({serverPublicKey}) -> {online, challenge}`
//! - `connect({serverPublicKey, challengeAnswer, payload}) -> {sessionId}`
//! - `poll({sessionId, lastUpdate}) -> {success, payload?}`

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::SignatureAlgorithm;

pub const METHOD_GET_SERVER_INFO: &str = "getServerInfo";
pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_POLL: &str = "poll";

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// One signaling message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RelayError>,
    },
}

impl Envelope {
    pub fn request(
        request_id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self::Request {
            request_id: request_id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn ok(request_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Response {
            request_id: request_id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, error: RelayError) -> Self {
        Self::Response {
            request_id: request_id.into(),
            data: None,
            error: Some(error),
        }
    }

    /// Best-effort extraction of a `requestId` from a frame that failed to parse.
    pub fn salvage_request_id(raw: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        value
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Errors crossing the trust boundary
// ═══════════════════════════════════════════════════════════════════════════

/// Error codes carried in response envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorCode {
    InvalidRequest,
    UnknownMethod,
    Offline,
    AuthFailed,
    RegistryFull,
    NotFound,
    Internal,
}

/// Structured relay error: a code plus a short human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RelayError {
    pub code: RelayErrorCode,
    pub message: String,
}

impl RelayError {
    pub fn new(code: RelayErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RelayErrorCode::InvalidRequest, message)
    }

    pub fn offline() -> Self {
        Self::new(RelayErrorCode::Offline, "Server is offline")
    }

    pub fn auth_failed() -> Self {
        Self::new(RelayErrorCode::AuthFailed, "Authentication failed")
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Negotiation payloads
// ═══════════════════════════════════════════════════════════════════════════

/// A single ICE candidate as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Session description plus the candidates gathered for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationPayload {
    pub sdp: String,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

/// The statement an agent signs when answering an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerStatement {
    pub server_public_key: String,
    pub session_id: String,
    pub timestamp: i64,
    pub payload: NegotiationPayload,
}

/// An answer plus its detached signature, as stored by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAnswer {
    pub server_public_key: String,
    pub session_id: String,
    pub timestamp: i64,
    pub payload: NegotiationPayload,
    pub signature: String,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
}

impl SignedAnswer {
    /// The part of the answer that is covered by the signature.
    pub fn statement(&self) -> AnswerStatement {
        AnswerStatement {
            server_public_key: self.server_public_key.clone(),
            session_id: self.session_id.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Method params & results
// ═══════════════════════════════════════════════════════════════════════════

/// getServerInfo params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetServerInfoParams {
    pub server_public_key: String,
}

/// getServerInfo result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

/// connect params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub server_public_key: String,
    pub challenge_answer: String,
    pub payload: NegotiationPayload,
}

/// connect result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub session_id: String,
}

/// poll params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollParams {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
}

/// poll result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SignedAnswer>,
}

impl PollResult {
    pub fn pending() -> Self {
        Self {
            success: false,
            payload: None,
        }
    }

    pub fn ready(answer: SignedAnswer) -> Self {
        Self {
            success: true,
            payload: Some(answer),
        }
    }
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnknownMethod => "unknown_method",
            Self::Offline => "offline",
            Self::AuthFailed => "auth_failed",
            Self::RegistryFull => "registry_full",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}
