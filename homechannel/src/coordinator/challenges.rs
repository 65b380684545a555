//! Issued challenges
//!
//! A challenge handed out by `getServerInfo` is bound to the signaling client
//! that asked for it and to the target agent. `connect` consumes it exactly
//! once, right or wrong; a newer `getServerInfo` from the same client
//! replaces it.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::crypto::ChallengePair;

/// Identifies one signaling connection.
pub type ClientId = u64;

#[derive(Debug, Clone)]
struct IssuedChallenge {
    pair: ChallengePair,
    issued_at: Instant,
}

/// Ledger of challenges awaiting a `connect`
pub struct IssuedChallenges {
    issued: DashMap<(ClientId, String), IssuedChallenge>,
    ttl: Duration,
}

impl IssuedChallenges {
    pub fn new(ttl: Duration) -> Self {
        Self {
            issued: DashMap::new(),
            ttl,
        }
    }

    /// Bind a challenge to `(client, agent)`, discarding any earlier one.
    pub fn issue(&self, client: ClientId, agent_public_key: &str, pair: ChallengePair) {
        self.issued.insert(
            (client, agent_public_key.to_string()),
            IssuedChallenge {
                pair,
                issued_at: Instant::now(),
            },
        );
    }

    /// Take the challenge bound to `(client, agent)` if it has not expired.
    pub fn consume(&self, client: ClientId, agent_public_key: &str) -> Option<ChallengePair> {
        let (_, issued) = self
            .issued
            .remove(&(client, agent_public_key.to_string()))?;
        if issued.issued_at.elapsed() > self.ttl {
            return None;
        }
        Some(issued.pair)
    }

    /// Drop everything issued to a client whose signaling channel closed.
    pub fn forget_client(&self, client: ClientId) {
        self.issued.retain(|(c, _), _| *c != client);
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, c| c.issued_at.elapsed() <= self.ttl);
        before.saturating_sub(self.issued.len())
    }

    pub fn count(&self) -> usize {
        self.issued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(n: &str) -> ChallengePair {
        ChallengePair {
            nonce: n.into(),
            answer_digest: "d".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_once() {
        let ledger = IssuedChallenges::new(Duration::from_secs(30));
        ledger.issue(1, "agent", pair("n1"));
        assert_eq!(ledger.consume(1, "agent").unwrap().nonce, "n1");
        assert!(ledger.consume(1, "agent").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_to_client_and_agent() {
        let ledger = IssuedChallenges::new(Duration::from_secs(30));
        ledger.issue(1, "agent", pair("n1"));
        assert!(ledger.consume(2, "agent").is_none());
        assert!(ledger.consume(1, "other").is_none());
        assert!(ledger.consume(1, "agent").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reissue_replaces() {
        let ledger = IssuedChallenges::new(Duration::from_secs(30));
        ledger.issue(1, "agent", pair("n1"));
        ledger.issue(1, "agent", pair("n2"));
        assert_eq!(ledger.consume(1, "agent").unwrap().nonce, "n2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let ledger = IssuedChallenges::new(Duration::from_secs(30));
        ledger.issue(1, "a", pair("n1"));
        ledger.issue(2, "a", pair("n2"));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(ledger.consume(1, "a").is_none());
        assert_eq!(ledger.purge_expired(), 1);
        assert_eq!(ledger.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_client() {
        let ledger = IssuedChallenges::new(Duration::from_secs(30));
        ledger.issue(1, "a", pair("n1"));
        ledger.issue(1, "b", pair("n2"));
        ledger.issue(2, "a", pair("n3"));
        ledger.forget_client(1);
        assert_eq!(ledger.count(), 1);
    }
}
