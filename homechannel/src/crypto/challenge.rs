//! Challenge-response authentication
//!
//! A client proves knowledge of the shared password by answering a nonce with
//! `hex(SHA-256(nonce ++ password))`. The password itself never leaves the
//! party that typed it.
//!
//! The agent owns the password and a [`ChallengeAuthenticator`]. It mints
//! `(nonce, answer)` pairs ahead of time and hands them to the coordinator,
//! which therefore only ever holds derived digests. When an offer arrives the
//! agent re-checks the client's answer itself; each nonce verifies at most once.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use zeroize::Zeroizing;

/// Nonce length in bytes (rendered as 64 hex characters).
pub const NONCE_BYTES: usize = 32;

/// A nonce together with the answer a password holder must produce for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePair {
    pub nonce: String,
    pub answer_digest: String,
}

/// Generate a fresh high-entropy nonce as lowercase hex.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `hex(SHA-256(nonce ++ secret))`
pub fn compute_answer(nonce: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time digest comparison. Case-insensitive on hex input.
pub fn digests_match(expected: &str, candidate: &str) -> bool {
    let expected = expected.trim().to_ascii_lowercase();
    let candidate = candidate.trim().to_ascii_lowercase();
    if expected.len() != candidate.len() {
        return false;
    }
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}

/// Secret-holding side of the challenge scheme.
///
/// Tracks the nonces it has issued; a nonce is discarded on its first
/// verification attempt, whether or not the answer was right.
pub struct ChallengeAuthenticator {
    secret: Zeroizing<String>,
    ttl: Duration,
    outstanding: Mutex<HashMap<String, Instant>>,
}

impl ChallengeAuthenticator {
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            ttl,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh nonce and remember it as outstanding.
    pub fn issue_challenge(&self) -> String {
        let nonce = generate_nonce();
        let now = Instant::now();
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|_, issued_at| now.duration_since(*issued_at) < self.ttl);
        outstanding.insert(nonce.clone(), now);
        nonce
    }

    /// Issue a nonce along with its expected answer, for handing to the coordinator.
    pub fn issue_pair(&self) -> ChallengePair {
        let nonce = self.issue_challenge();
        let answer_digest = compute_answer(&nonce, &self.secret);
        ChallengePair {
            nonce,
            answer_digest,
        }
    }

    /// Issue `count` pairs at once.
    pub fn issue_batch(&self, count: usize) -> Vec<ChallengePair> {
        (0..count).map(|_| self.issue_pair()).collect()
    }

    /// Check a candidate answer for a nonce this authenticator issued.
    ///
    /// The nonce is consumed on every call. Unknown or expired nonces fail.
    pub fn verify_answer(&self, nonce: &str, candidate: &str) -> bool {
        let issued_at = self.outstanding.lock().remove(nonce);
        match issued_at {
            Some(at) if at.elapsed() < self.ttl => {
                digests_match(&compute_answer(nonce, &self.secret), candidate)
            }
            _ => false,
        }
    }

    /// Number of nonces issued and not yet consumed or expired.
    pub fn outstanding(&self) -> usize {
        let now = Instant::now();
        self.outstanding
            .lock()
            .values()
            .filter(|at| now.duration_since(**at) < self.ttl)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip_bit(hex_digest: &str, bit: usize) -> String {
        let mut bytes = hex::decode(hex_digest).unwrap();
        bytes[bit / 8] ^= 1 << (bit % 8);
        hex::encode(bytes)
    }

    #[test]
    fn test_known_answer() {
        // sha256("abc" ++ "") == sha256("abc")
        assert_eq!(
            compute_answer("abc", ""),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(compute_answer("ab", "c"), compute_answer("abc", ""));
    }

    #[test]
    fn test_nonce_shape() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_roundtrip_and_single_use() {
        let auth = ChallengeAuthenticator::new("correct-password", Duration::from_secs(60));
        let nonce = auth.issue_challenge();
        let answer = compute_answer(&nonce, "correct-password");

        assert!(auth.verify_answer(&nonce, &answer));
        // Second use of the same nonce is rejected
        assert!(!auth.verify_answer(&nonce, &answer));
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let auth = ChallengeAuthenticator::new("s3cret", Duration::from_secs(60));
        for bit in [0, 7, 100, 255] {
            let nonce = auth.issue_challenge();
            let answer = compute_answer(&nonce, "s3cret");
            assert!(!auth.verify_answer(&nonce, &flip_bit(&answer, bit)));
        }
    }

    #[test]
    fn test_failed_attempt_consumes_nonce() {
        let auth = ChallengeAuthenticator::new("pw", Duration::from_secs(60));
        let nonce = auth.issue_challenge();
        assert!(!auth.verify_answer(&nonce, &compute_answer(&nonce, "wrong")));
        assert!(!auth.verify_answer(&nonce, &compute_answer(&nonce, "pw")));
        assert_eq!(auth.outstanding(), 0);
    }

    #[test]
    fn test_unknown_nonce_rejected() {
        let auth = ChallengeAuthenticator::new("pw", Duration::from_secs(60));
        let nonce = generate_nonce();
        assert!(!auth.verify_answer(&nonce, &compute_answer(&nonce, "pw")));
    }

    #[test]
    fn test_pairs_match_computed_answers() {
        let auth = ChallengeAuthenticator::new("pw", Duration::from_secs(60));
        let batch = auth.issue_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(auth.outstanding(), 3);
        for pair in &batch {
            assert_eq!(pair.answer_digest, compute_answer(&pair.nonce, "pw"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_nonce_rejected() {
        let auth = ChallengeAuthenticator::new("pw", Duration::from_secs(5));
        let nonce = auth.issue_challenge();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!auth.verify_answer(&nonce, &compute_answer(&nonce, "pw")));
    }

    #[test]
    fn test_digest_comparison() {
        let d = compute_answer("n", "s");
        assert!(digests_match(&d, &d.to_uppercase()));
        assert!(!digests_match(&d, &d[..10]));
        assert!(!digests_match(&d, ""));
    }
}
