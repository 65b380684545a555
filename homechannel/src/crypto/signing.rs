//! Detached signature verification over canonical JSON
//!
//! The agent signs a canonical rendering of its answer statement; the client
//! verifies it against the public key the operator handed out of band.
//!
//! Key encodings accepted everywhere:
//! - PEM `-----BEGIN PUBLIC KEY-----` armour around a DER SubjectPublicKeyInfo
//! - raw base64 of the same DER bytes
//!
//! Signatures travel as lowercase hex. ECDSA signatures may be DER or the
//! fixed 64-byte `r || s` form; EdDSA signatures are the raw RFC 8032 bytes.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Algorithm assumed when a peer omits the field.
pub const DEFAULT_SIGNATURE_ALGORITHM: SignatureAlgorithm = SignatureAlgorithm::Ed25519;

/// Signature verification errors
///
/// Only input errors surface here. A signature that fails to decode or verify
/// is reported as `Ok(false)` by [`verify`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[default]
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "ed448")]
    Ed448,
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
}

/// DER prefix of an Ed448 SubjectPublicKeyInfo (RFC 8410); the raw key follows.
pub(crate) const ED448_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x43, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x71, 0x03, 0x3a, 0x00,
];

/// Ed448 public key and seed length
pub(crate) const ED448_KEY_LENGTH: usize = 57;

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Ed448 => "ed448",
            Self::EcdsaP256 => "ecdsa-p256",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ed25519" => Ok(Self::Ed25519),
            "ed448" => Ok(Self::Ed448),
            "ecdsa-p256" | "ecdsa" | "p256" | "es256" => Ok(Self::EcdsaP256),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Parse an optional algorithm name, falling back to the default when absent.
pub fn parse_algorithm(name: Option<&str>) -> Result<SignatureAlgorithm, SignatureError> {
    match name {
        None => Ok(DEFAULT_SIGNATURE_ALGORITHM),
        Some(s) if s.trim().is_empty() => Ok(DEFAULT_SIGNATURE_ALGORITHM),
        Some(s) => s.parse(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Canonical JSON
// ═══════════════════════════════════════════════════════════════════════════

/// Serialize a value as canonical JSON: sorted object keys, no whitespace.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<Vec<u8>, SignatureError> {
    let json =
        serde_json::to_value(value).map_err(|e| SignatureError::Serialization(e.to_string()))?;
    let mut out = String::new();
    write_canonical(&json, &mut out);
    Ok(out.into_bytes())
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json escaping of a plain string is already canonical
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Public keys
// ═══════════════════════════════════════════════════════════════════════════

/// Decode a PEM-armoured or raw base64 public key into DER bytes.
pub fn decode_public_key(input: &str) -> Result<Vec<u8>, SignatureError> {
    let trimmed = input.trim();
    let body: String = if trimmed.starts_with("-----BEGIN") {
        trimmed
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .map(str::trim)
            .collect()
    } else {
        trimmed.chars().filter(|c| !c.is_whitespace()).collect()
    };

    if body.is_empty() {
        return Err(SignatureError::InvalidPublicKey("empty key".to_string()));
    }

    BASE64
        .decode(body.as_bytes())
        .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))
}

/// Canonical identity for a public key: base64 of its DER encoding.
///
/// PEM and raw-base64 renderings of the same key normalise to the same string.
pub fn normalize_public_key(input: &str) -> Result<String, SignatureError> {
    decode_public_key(input).map(|der| BASE64.encode(der))
}

/// Short, log-safe rendering of a public key.
pub fn key_fingerprint(public_key: &str) -> String {
    let tail: String = public_key
        .chars()
        .rev()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

// ═══════════════════════════════════════════════════════════════════════════
// Verification
// ═══════════════════════════════════════════════════════════════════════════

/// Verify a hex signature over the canonical JSON rendering of `payload`.
///
/// Returns `Ok(false)` for any decoding or verification failure. Errors are
/// reserved for input the caller must fix, such as an unknown algorithm name
/// passed to [`verify_named`].
pub fn verify<T: Serialize>(
    payload: &T,
    signature_hex: &str,
    public_key: &str,
    algorithm: SignatureAlgorithm,
) -> Result<bool, SignatureError> {
    let message = match canonicalize(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!("[signature] payload not serializable: {}", e);
            return Ok(false);
        }
    };
    Ok(verify_bytes(&message, signature_hex, public_key, algorithm))
}

/// Same as [`verify`] for an algorithm given by name (`None` selects the default).
pub fn verify_named<T: Serialize>(
    payload: &T,
    signature_hex: &str,
    public_key: &str,
    algorithm: Option<&str>,
) -> Result<bool, SignatureError> {
    let algorithm = parse_algorithm(algorithm)?;
    verify(payload, signature_hex, public_key, algorithm)
}

fn verify_bytes(
    message: &[u8],
    signature_hex: &str,
    public_key: &str,
    algorithm: SignatureAlgorithm,
) -> bool {
    let der = match decode_public_key(public_key) {
        Ok(der) => der,
        Err(e) => {
            debug!("[signature] {}", e);
            return false;
        }
    };
    let signature = match hex::decode(signature_hex.trim()) {
        Ok(sig) => sig,
        Err(e) => {
            debug!("[signature] signature is not hex: {}", e);
            return false;
        }
    };

    let result = match algorithm {
        SignatureAlgorithm::Ed25519 => verify_ed25519(message, &signature, &der),
        SignatureAlgorithm::Ed448 => verify_ed448(message, &signature, &der),
        SignatureAlgorithm::EcdsaP256 => verify_p256(message, &signature, &der),
    };

    match result {
        Ok(()) => true,
        Err(reason) => {
            debug!("[signature] {} verification failed: {}", algorithm, reason);
            false
        }
    }
}

fn verify_ed25519(message: &[u8], signature: &[u8], der: &[u8]) -> Result<(), String> {
    use ed25519_dalek::pkcs8::DecodePublicKey;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let key = VerifyingKey::from_public_key_der(der).map_err(|e| e.to_string())?;
    let signature = Signature::from_slice(signature).map_err(|e| e.to_string())?;
    key.verify(message, &signature).map_err(|e| e.to_string())
}

fn verify_ed448(message: &[u8], signature: &[u8], der: &[u8]) -> Result<(), String> {
    use ed448_goldilocks_plus::{PublicKeyBytes, Signature, VerifyingKey};

    let raw = der
        .strip_prefix(ED448_SPKI_PREFIX.as_slice())
        .filter(|raw| raw.len() == ED448_KEY_LENGTH)
        .ok_or("not an Ed448 SubjectPublicKeyInfo")?;
    let raw: [u8; ED448_KEY_LENGTH] = raw.try_into().map_err(|e| format!("{:?}", e))?;
    let key = VerifyingKey::try_from(PublicKeyBytes(raw)).map_err(|e| format!("{:?}", e))?;
    let signature = Signature::try_from(signature).map_err(|e| format!("{:?}", e))?;
    key.verify_raw(&signature, message)
        .map_err(|e| format!("{:?}", e))
}

fn verify_p256(message: &[u8], signature: &[u8], der: &[u8]) -> Result<(), String> {
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use p256::pkcs8::DecodePublicKey;

    let key = VerifyingKey::from_public_key_der(der).map_err(|e| e.to_string())?;
    let signature = Signature::from_der(signature)
        .or_else(|_| Signature::from_slice(signature))
        .map_err(|e| e.to_string())?;
    key.verify(message, &signature).map_err(|e| e.to_string())
}
