//! Agent signing identity
//!
//! The private key is stored as PKCS#8 PEM. The public key is exported as
//! base64 of its DER SubjectPublicKeyInfo, which is the string operators hand
//! to clients.
//!
//! Ed448 keys are kept as their 57-byte RFC 8032 seed and wrapped in the
//! fixed RFC 8410 PKCS#8 / SPKI encodings here.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::pkcs8::der::pem::{self, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tracing::info;
use zeroize::Zeroizing;

use super::AgentError;
use crate::coordinator::datagram::{AgentDatagram, PresenceKind, PresenceStatement};
use crate::crypto::signing::{ED448_KEY_LENGTH, ED448_SPKI_PREFIX};
use crate::crypto::{canonicalize, key_fingerprint, ChallengePair, SignatureAlgorithm};
use crate::signaling::protocol::{AnswerStatement, NegotiationPayload, SignedAnswer};

/// DER prefix of an Ed448 PKCS#8 PrivateKeyInfo; the seed follows.
const ED448_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x47, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x71, 0x04, 0x3b, 0x04, 0x39,
];

enum KeyPair {
    Ed25519(ed25519_dalek::SigningKey),
    Ed448(Zeroizing<[u8; ED448_KEY_LENGTH]>),
    EcdsaP256(p256::SecretKey),
}

fn ed448_signing_key(seed: &[u8]) -> Result<ed448_goldilocks_plus::SigningKey, AgentError> {
    ed448_goldilocks_plus::SigningKey::try_from(seed).map_err(|e| AgentError::Key(format!("{:?}", e)))
}

fn ed448_public_der(seed: &[u8]) -> Result<Vec<u8>, AgentError> {
    let key = ed448_signing_key(seed)?;
    let mut der = ED448_SPKI_PREFIX.to_vec();
    der.extend_from_slice(key.verifying_key().to_bytes().as_ref());
    Ok(der)
}

/// Long-term key pair the agent signs its answers with
pub struct AgentIdentity {
    key: KeyPair,
    public_key: String,
}

impl AgentIdentity {
    /// Generate a fresh key pair.
    pub fn generate(algorithm: SignatureAlgorithm) -> Self {
        let key = match algorithm {
            SignatureAlgorithm::Ed25519 => {
                KeyPair::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
            }
            SignatureAlgorithm::Ed448 => {
                let mut seed = Zeroizing::new([0u8; ED448_KEY_LENGTH]);
                OsRng.fill_bytes(seed.as_mut_slice());
                KeyPair::Ed448(seed)
            }
            SignatureAlgorithm::EcdsaP256 => KeyPair::EcdsaP256(p256::SecretKey::random(&mut OsRng)),
        };
        Self::from_key(key)
    }

    fn from_key(key: KeyPair) -> Self {
        let der = match &key {
            KeyPair::Ed25519(k) => {
                use ed25519_dalek::pkcs8::EncodePublicKey;
                k.verifying_key()
                    .to_public_key_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .ok()
            }
            KeyPair::Ed448(seed) => ed448_public_der(seed.as_slice()).ok(),
            KeyPair::EcdsaP256(k) => {
                use p256::pkcs8::EncodePublicKey;
                k.public_key()
                    .to_public_key_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .ok()
            }
        };
        // SPKI encoding of a valid in-memory key cannot fail
        let public_key = der.map(|d| BASE64.encode(d)).unwrap_or_default();
        Self { key, public_key }
    }

    /// Parse a PKCS#8 PEM private key of the given algorithm.
    pub fn from_pem(pem: &str, algorithm: SignatureAlgorithm) -> Result<Self, AgentError> {
        let key = match algorithm {
            SignatureAlgorithm::Ed25519 => {
                use ed25519_dalek::pkcs8::DecodePrivateKey;
                KeyPair::Ed25519(
                    ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
                        .map_err(|e| AgentError::Key(e.to_string()))?,
                )
            }
            SignatureAlgorithm::Ed448 => {
                let (label, der) =
                    pem::decode_vec(pem.as_bytes()).map_err(|e| AgentError::Key(e.to_string()))?;
                let der = Zeroizing::new(der);
                let seed = der
                    .strip_prefix(ED448_PKCS8_PREFIX.as_slice())
                    .filter(|seed| label == "PRIVATE KEY" && seed.len() == ED448_KEY_LENGTH)
                    .ok_or_else(|| AgentError::Key("not an Ed448 PKCS#8 key".into()))?;
                let mut stored = Zeroizing::new([0u8; ED448_KEY_LENGTH]);
                stored.copy_from_slice(seed);
                ed448_signing_key(stored.as_slice())?;
                KeyPair::Ed448(stored)
            }
            SignatureAlgorithm::EcdsaP256 => {
                use p256::pkcs8::DecodePrivateKey;
                KeyPair::EcdsaP256(
                    p256::SecretKey::from_pkcs8_pem(pem)
                        .map_err(|e| AgentError::Key(e.to_string()))?,
                )
            }
        };
        Ok(Self::from_key(key))
    }

    /// PKCS#8 PEM rendering of the private key.
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, AgentError> {
        let pem = match &self.key {
            KeyPair::Ed25519(k) => {
                use ed25519_dalek::pkcs8::EncodePrivateKey;
                k.to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
                    .map_err(|e| AgentError::Key(e.to_string()))?
                    .to_string()
            }
            KeyPair::Ed448(seed) => {
                let mut der = Zeroizing::new(ED448_PKCS8_PREFIX.to_vec());
                der.extend_from_slice(seed.as_slice());
                pem::encode_string("PRIVATE KEY", LineEnding::LF, &der)
                    .map_err(|e| AgentError::Key(e.to_string()))?
            }
            KeyPair::EcdsaP256(k) => {
                use p256::pkcs8::EncodePrivateKey;
                k.to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| AgentError::Key(e.to_string()))?
                    .to_string()
            }
        };
        Ok(Zeroizing::new(pem))
    }

    /// Load the key at `path`, or generate one and store it there.
    pub fn load_or_create(path: &Path, algorithm: SignatureAlgorithm) -> Result<Self, AgentError> {
        if path.exists() {
            let pem = Zeroizing::new(std::fs::read_to_string(path)?);
            let identity = Self::from_pem(&pem, algorithm)?;
            info!(
                "[agent] loaded {} key {}",
                algorithm,
                key_fingerprint(&identity.public_key)
            );
            return Ok(identity);
        }

        let identity = Self::generate(algorithm);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pem = identity.private_key_pem()?;
        std::fs::write(path, pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(
            "[agent] generated {} key {} at {}",
            algorithm,
            key_fingerprint(&identity.public_key),
            path.display()
        );
        Ok(identity)
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self.key {
            KeyPair::Ed25519(_) => SignatureAlgorithm::Ed25519,
            KeyPair::Ed448(_) => SignatureAlgorithm::Ed448,
            KeyPair::EcdsaP256(_) => SignatureAlgorithm::EcdsaP256,
        }
    }

    /// Base64 DER public key
    pub fn public_key(&self) -> String {
        self.public_key.clone()
    }

    pub fn public_key_pem(&self) -> Result<String, AgentError> {
        match &self.key {
            KeyPair::Ed25519(k) => {
                use ed25519_dalek::pkcs8::EncodePublicKey;
                k.verifying_key()
                    .to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
                    .map_err(|e| AgentError::Key(e.to_string()))
            }
            KeyPair::Ed448(seed) => {
                let der = ed448_public_der(seed.as_slice())?;
                pem::encode_string("PUBLIC KEY", LineEnding::LF, &der)
                    .map_err(|e| AgentError::Key(e.to_string()))
            }
            KeyPair::EcdsaP256(k) => {
                use p256::pkcs8::EncodePublicKey;
                k.public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .map_err(|e| AgentError::Key(e.to_string()))
            }
        }
    }

    /// Hex signature over the canonical JSON rendering of `payload`.
    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String, AgentError> {
        let message = canonicalize(payload)?;
        let signature = match &self.key {
            KeyPair::Ed25519(k) => {
                use ed25519_dalek::Signer;
                k.sign(&message).to_bytes().to_vec()
            }
            KeyPair::Ed448(seed) => ed448_signing_key(seed.as_slice())?
                .sign_raw(&message)
                .to_bytes()
                .to_vec(),
            KeyPair::EcdsaP256(k) => {
                use p256::ecdsa::signature::Signer;
                let signing_key = p256::ecdsa::SigningKey::from(k);
                let signature: p256::ecdsa::Signature = signing_key.sign(&message);
                signature.to_bytes().to_vec()
            }
        };
        Ok(hex::encode(signature))
    }

    /// Signed `register` or `keepalive` datagram carrying `challenges`.
    pub fn presence(
        &self,
        kind: PresenceKind,
        timestamp: i64,
        challenges: Vec<ChallengePair>,
    ) -> Result<AgentDatagram, AgentError> {
        let signature = self.sign(&PresenceStatement {
            kind,
            public_key: &self.public_key,
            timestamp,
            challenges: &challenges,
        })?;
        let public_key = self.public_key.clone();
        Ok(match kind {
            PresenceKind::Register => AgentDatagram::Register {
                public_key,
                signature_algorithm: self.algorithm(),
                timestamp,
                challenges,
                signature,
            },
            PresenceKind::Keepalive => AgentDatagram::Keepalive {
                public_key,
                timestamp,
                challenges,
                signature,
            },
        })
    }

    /// Sign an answer for `session_id`.
    pub fn sign_answer(
        &self,
        session_id: &str,
        timestamp: i64,
        payload: NegotiationPayload,
    ) -> Result<SignedAnswer, AgentError> {
        let statement = AnswerStatement {
            server_public_key: self.public_key.clone(),
            session_id: session_id.to_string(),
            timestamp,
            payload,
        };
        let signature = self.sign(&statement)?;
        Ok(SignedAnswer {
            server_public_key: statement.server_public_key,
            session_id: statement.session_id,
            timestamp: statement.timestamp,
            payload: statement.payload,
            signature,
            signature_algorithm: self.algorithm(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify;

    #[test]
    fn test_signed_answer_verifies() {
        for algorithm in [
            SignatureAlgorithm::Ed25519,
            SignatureAlgorithm::Ed448,
            SignatureAlgorithm::EcdsaP256,
        ] {
            let identity = AgentIdentity::generate(algorithm);
            let answer = identity
                .sign_answer(
                    "s1",
                    42,
                    NegotiationPayload {
                        sdp: "v=0".into(),
                        candidates: vec![],
                    },
                )
                .unwrap();
            assert_eq!(answer.signature_algorithm, algorithm);
            assert!(verify(
                &answer.statement(),
                &answer.signature,
                &identity.public_key(),
                algorithm
            )
            .unwrap());
        }
    }

    #[test]
    fn test_presence_statement_verifies() {
        let identity = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let challenges = vec![ChallengePair {
            nonce: "ab".into(),
            answer_digest: "cd".into(),
        }];
        let datagram = identity
            .presence(PresenceKind::Keepalive, 7, challenges)
            .unwrap();
        let (statement, signature) = datagram.presence().unwrap();
        assert_eq!(statement.kind, PresenceKind::Keepalive);
        assert!(verify(&statement, signature, &identity.public_key(), identity.algorithm()).unwrap());

        // Any field change breaks the signature
        let moved = PresenceStatement {
            timestamp: 8,
            ..statement.clone()
        };
        assert!(!verify(&moved, signature, &identity.public_key(), identity.algorithm()).unwrap());
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("agent.pem");

        let created = AgentIdentity::load_or_create(&path, SignatureAlgorithm::EcdsaP256).unwrap();
        let loaded = AgentIdentity::load_or_create(&path, SignatureAlgorithm::EcdsaP256).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_ed448_key_round_trips_through_pem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pem");

        let created = AgentIdentity::load_or_create(&path, SignatureAlgorithm::Ed448).unwrap();
        let loaded = AgentIdentity::load_or_create(&path, SignatureAlgorithm::Ed448).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
        assert!(created.public_key_pem().unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));

        // A signature from the reloaded key verifies against the original public key
        let payload = serde_json::json!({"sessionId": "s"});
        let signature = loaded.sign(&payload).unwrap();
        assert!(verify(&payload, &signature, &created.public_key(), SignatureAlgorithm::Ed448).unwrap());

        assert!(matches!(
            AgentIdentity::from_pem(&created.private_key_pem().unwrap(), SignatureAlgorithm::Ed25519),
            Err(AgentError::Key(_))
        ));
    }

    #[test]
    fn test_wrong_algorithm_for_stored_key() {
        let identity = AgentIdentity::generate(SignatureAlgorithm::Ed25519);
        let pem = identity.private_key_pem().unwrap();
        assert!(matches!(
            AgentIdentity::from_pem(&pem, SignatureAlgorithm::EcdsaP256),
            Err(AgentError::Key(_))
        ));
    }
}
