//! Agent Registry - currently reachable agents
//!
//! Keyed by normalised public key. A record is live while
//! `now - last_seen_at <= server_timeout`; lookups never return a stale
//! record even before the background sweep removes it.
//!
//! Callers verify the agent's signature before calling in. The registry only
//! enforces that each accepted statement is newer than the last one, so a
//! captured datagram cannot be replayed from another address.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::crypto::{key_fingerprint, ChallengePair, SignatureAlgorithm};

/// Upper bound on challenge pairs held per agent.
pub const MAX_POOLED_CHALLENGES: usize = 16;

/// Registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry is full ({0} servers)")]
    Full(usize),

    #[error("Unknown server")]
    Unknown,

    #[error("Statement is not newer than the last one accepted")]
    Replayed,
}

/// A registered agent
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub public_key: String,
    pub signature_algorithm: SignatureAlgorithm,
    pub registered_at: Instant,
    pub last_seen_at: Instant,
    /// Relay path back to the agent
    pub transport_address: SocketAddr,
    /// Unissued `(nonce, expected answer digest)` pairs
    pub challenges: VecDeque<ChallengePair>,
    /// Timestamp of the last accepted register/keepalive statement
    pub last_statement_at: i64,
}

/// Coordinator-side table of live agents
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    max_servers: usize,
    server_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(max_servers: usize, server_timeout: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            max_servers,
            server_timeout,
        }
    }

    pub fn server_timeout(&self) -> Duration {
        self.server_timeout
    }

    fn is_live(&self, record: &AgentRecord, now: Instant) -> bool {
        now.saturating_duration_since(record.last_seen_at) <= self.server_timeout
    }

    /// Register (or re-register) an agent.
    ///
    /// Re-registration replaces the existing record. A new key is rejected
    /// when the registry is at capacity; stale records do not count.
    pub fn register(
        &self,
        public_key: String,
        signature_algorithm: SignatureAlgorithm,
        transport_address: SocketAddr,
        statement_at: i64,
        challenges: Vec<ChallengePair>,
    ) -> Result<(), RegistryError> {
        let now = Instant::now();
        let mut agents = self.agents.write();

        if let Some(existing) = agents.get(&public_key) {
            if statement_at <= existing.last_statement_at {
                return Err(RegistryError::Replayed);
            }
        }

        if !agents.contains_key(&public_key) && agents.len() >= self.max_servers {
            agents.retain(|_, r| now.saturating_duration_since(r.last_seen_at) <= self.server_timeout);
            if agents.len() >= self.max_servers {
                return Err(RegistryError::Full(self.max_servers));
            }
        }

        info!(
            "[registry] agent registered: key={}, addr={}, alg={}",
            key_fingerprint(&public_key),
            transport_address,
            signature_algorithm
        );

        let record = AgentRecord {
            public_key: public_key.clone(),
            signature_algorithm,
            registered_at: now,
            last_seen_at: now,
            transport_address,
            challenges: bounded_pool(challenges),
            last_statement_at: statement_at,
        };
        agents.insert(public_key, record);
        Ok(())
    }

    /// Refresh `last_seen_at` and replace the challenge pool.
    ///
    /// Fails with `Unknown` for keys never registered or already expired; the
    /// agent is expected to register again. A statement no newer than the
    /// last accepted one fails with `Replayed` and changes nothing.
    pub fn keepalive(
        &self,
        public_key: &str,
        transport_address: SocketAddr,
        statement_at: i64,
        challenges: Vec<ChallengePair>,
    ) -> Result<(), RegistryError> {
        let now = Instant::now();
        let mut agents = self.agents.write();

        let live = match agents.get(public_key) {
            Some(record) => self.is_live(record, now),
            None => return Err(RegistryError::Unknown),
        };
        if !live {
            agents.remove(public_key);
            debug!(
                "[registry] keepalive from expired agent {}",
                key_fingerprint(public_key)
            );
            return Err(RegistryError::Unknown);
        }

        if let Some(record) = agents.get_mut(public_key) {
            if statement_at <= record.last_statement_at {
                debug!(
                    "[registry] replayed keepalive for {} from {}",
                    key_fingerprint(public_key),
                    transport_address
                );
                return Err(RegistryError::Replayed);
            }
            record.last_statement_at = statement_at;
            record.last_seen_at = now;
            if record.transport_address != transport_address {
                info!(
                    "[registry] agent {} moved {} -> {}",
                    key_fingerprint(public_key),
                    record.transport_address,
                    transport_address
                );
                record.transport_address = transport_address;
            }
            if !challenges.is_empty() {
                record.challenges = bounded_pool(challenges);
            }
        }
        Ok(())
    }

    /// Algorithm of a registered key, live or not.
    pub fn algorithm_of(&self, public_key: &str) -> Option<SignatureAlgorithm> {
        self.agents
            .read()
            .get(public_key)
            .map(|r| r.signature_algorithm)
    }

    /// Live record for a key, if any.
    pub fn lookup(&self, public_key: &str) -> Option<AgentRecord> {
        let now = Instant::now();
        self.agents
            .read()
            .get(public_key)
            .filter(|r| self.is_live(r, now))
            .cloned()
    }

    /// Remove and return one unissued challenge for a live agent.
    pub fn take_challenge(&self, public_key: &str) -> Option<ChallengePair> {
        let now = Instant::now();
        let mut agents = self.agents.write();
        let record = agents.get_mut(public_key)?;
        if !self.is_live(record, now) {
            return None;
        }
        record.challenges.pop_front()
    }

    /// Drop every record older than the server timeout. Returns how many.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut agents = self.agents.write();
        let before = agents.len();
        agents.retain(|key, record| {
            let keep = now.saturating_duration_since(record.last_seen_at) <= self.server_timeout;
            if !keep {
                info!("[registry] evicting silent agent {}", key_fingerprint(key));
            }
            keep
        });
        before - agents.len()
    }

    /// Number of records, including ones awaiting eviction.
    pub fn count(&self) -> usize {
        self.agents.read().len()
    }
}

fn bounded_pool(mut challenges: Vec<ChallengePair>) -> VecDeque<ChallengePair> {
    challenges.truncate(MAX_POOLED_CHALLENGES);
    challenges.into()
}
