//! Signaling - request/response channel between client and coordinator
//!
//! `protocol` defines the envelope and relay method payloads shared by both
//! ends; `client` is the client-side WebSocket implementation.

pub mod client;
pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{WsSignalingChannel, WsSignalingConnector};
pub use protocol::{Envelope, RelayError, RelayErrorCode};

/// Signaling errors
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("Signaling channel did not open within {0:?}")]
    OpenTimeout(Duration),

    #[error("Failed to open signaling channel: {0}")]
    Open(String),

    #[error("Signaling request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Signaling channel disconnected")]
    Disconnected,

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Unexpected response payload: {0}")]
    Decode(String),

    #[error("Coordinator error: {0}")]
    Remote(RelayError),
}

/// An open request/response channel to the coordinator.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one request and wait for the response with the same `requestId`.
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SignalingError>;

    /// Release the channel. Pending requests fail with `Disconnected`.
    /// Calling it more than once is a no-op.
    async fn close(&self);
}

/// Opens signaling channels, one per connection attempt.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn SignalingChannel>, SignalingError>;
}
