//! Cryptographic building blocks
//!
//! - `signing`: canonical JSON + detached signature verification
//! - `challenge`: nonce-based password proof

pub mod challenge;
pub mod signing;

pub use challenge::{
    compute_answer, digests_match, generate_nonce, ChallengeAuthenticator, ChallengePair,
};
pub use signing::{
    canonicalize, key_fingerprint, normalize_public_key, parse_algorithm, verify, verify_named,
    SignatureAlgorithm, SignatureError, DEFAULT_SIGNATURE_ALGORITHM,
};
