//! Configuration Types
//!
//! Coordinator, client and agent settings. Every field has a serde default so
//! partial JSON files load cleanly.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::crypto::SignatureAlgorithm;

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// WebSocket listener for client signaling
    pub signaling_addr: SocketAddr,

    /// UDP listener for agent registration
    pub agent_addr: SocketAddr,

    /// Registry capacity
    pub max_servers: usize,

    /// An agent silent for longer than this is evicted
    pub server_timeout_secs: u64,

    /// Lifetime of a negotiation session, answered or not
    pub session_ttl_secs: u64,

    /// Lifetime of a challenge handed out by getServerInfo
    pub challenge_ttl_secs: u64,

    /// Longest poll window a client is expected to use (interval × attempts)
    pub client_poll_window_secs: u64,

    /// Largest accepted difference between an agent's statement timestamp
    /// and the coordinator clock
    pub max_clock_skew_secs: u64,
}

fn default_signaling_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8443).into()
}

fn default_agent_addr() -> SocketAddr {
    ([0, 0, 0, 0], 3478).into()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            signaling_addr: default_signaling_addr(),
            agent_addr: default_agent_addr(),
            max_servers: 1000,
            server_timeout_secs: 60,
            session_ttl_secs: 60,
            challenge_ttl_secs: 30,
            client_poll_window_secs: 30,
            max_clock_skew_secs: 300,
        }
    }
}

impl CoordinatorConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }

    /// Eviction sweep period: half the server timeout, at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis((self.server_timeout_secs * 1000 / 2).max(1000))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_servers == 0 {
            return Err(ConfigError::Invalid("maxServers must be positive".into()));
        }
        if self.server_timeout_secs == 0 || self.challenge_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "serverTimeoutSecs and challengeTtlSecs must be positive".into(),
            ));
        }
        // A session must outlive the client's own polling so that `ready:false`
        // never hides a purge from a client that is still waiting.
        if self.session_ttl_secs < self.client_poll_window_secs {
            return Err(ConfigError::Invalid(format!(
                "sessionTtlSecs ({}) must be >= clientPollWindowSecs ({})",
                self.session_ttl_secs, self.client_poll_window_secs
            )));
        }
        Ok(())
    }
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

/// Client-side timeouts and polling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// e.g. `wss://relay.example.com/`
    pub coordinator_url: String,
    pub signaling_open_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub ice_gathering_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub transport_open_timeout_ms: u64,
    pub channel_open_timeout_ms: u64,
    pub control_request_timeout_ms: u64,

    /// STUN/TURN URLs for the WebRTC transport
    pub ice_servers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:8443/".to_string(),
            signaling_open_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            ice_gathering_timeout_ms: 3_000,
            poll_interval_ms: 1_000,
            poll_max_attempts: 30,
            transport_open_timeout_ms: 15_000,
            channel_open_timeout_ms: 10_000,
            control_request_timeout_ms: 10_000,
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    pub fn signaling_open_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_open_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transport_open_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_open_timeout_ms)
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_open_timeout_ms)
    }

    pub fn control_request_timeout(&self) -> Duration {
        Duration::from_millis(self.control_request_timeout_ms)
    }

    /// Upper bound on the answer wait: interval × attempts.
    pub fn poll_window(&self) -> Duration {
        self.poll_interval() * self.poll_max_attempts
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 || self.poll_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "pollIntervalMs and pollMaxAttempts must be positive".into(),
            ));
        }
        if !(self.coordinator_url.starts_with("ws://") || self.coordinator_url.starts_with("wss://"))
        {
            return Err(ConfigError::Invalid(format!(
                "coordinatorUrl must be a ws:// or wss:// URL: {}",
                self.coordinator_url
            )));
        }
        Ok(())
    }
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Coordinator UDP endpoint, `host:port`
    pub coordinator_addr: String,

    /// PKCS#8 PEM private key; created on first start when missing
    pub private_key_path: Option<String>,

    pub signature_algorithm: SignatureAlgorithm,

    /// Shared secret clients must prove knowledge of
    #[serde(skip_serializing)]
    pub password: String,

    pub keepalive_interval_secs: u64,

    /// Fresh challenge pairs sent with each register/keepalive
    pub challenge_batch: usize,

    pub challenge_ttl_secs: u64,

    /// How long to wait for local candidate gathering when answering
    pub ice_gathering_timeout_ms: u64,

    /// How long answered session ids are remembered for de-duplication
    pub answered_cache_secs: u64,

    pub ice_servers: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: "127.0.0.1:3478".to_string(),
            private_key_path: None,
            signature_algorithm: SignatureAlgorithm::default(),
            password: String::new(),
            keepalive_interval_secs: 20,
            challenge_batch: 4,
            challenge_ttl_secs: 120,
            ice_gathering_timeout_ms: 3_000,
            answered_cache_secs: 120,
            ice_servers: default_ice_servers(),
        }
    }
}

impl AgentConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn answered_cache(&self) -> Duration {
        Duration::from_secs(self.answered_cache_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.password.is_empty() {
            return Err(ConfigError::Invalid("password must not be empty".into()));
        }
        if self.keepalive_interval_secs == 0 || self.challenge_batch == 0 {
            return Err(ConfigError::Invalid(
                "keepaliveIntervalSecs and challengeBatch must be positive".into(),
            ));
        }
        // Pairs must survive at least one keepalive round at the coordinator
        if self.challenge_ttl_secs < self.keepalive_interval_secs * 2 {
            return Err(ConfigError::Invalid(
                "challengeTtlSecs must be at least twice keepaliveIntervalSecs".into(),
            ));
        }
        Ok(())
    }
}
