//! # Cryptographic Infrastructure
//!
//! Signing and verification primitives for peerchat messages:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and strict verification
//! - **Text encoding**: Signatures travel inside a [`Message`](crate::messages::Message)
//!   as lowercase hex, so they can be embedded in any text-oriented wire format
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted (64 bytes, `verify_strict`)
//! - Domain separation prevents a peerchat signature from being replayed as a
//!   signature over some other protocol's payload (and vice versa)
//! - Verification never panics: malformed input is just an invalid signature

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::Keypair;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature text is not valid hex.
    InvalidEncoding,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidEncoding => write!(f, "signature is not valid hex"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for chat message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"peerchat-message-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    prefixed
}

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
///
/// # Returns
/// 64-byte Ed25519 signature as a Vec<u8>
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// # Returns
/// `Ok(())` if signature is valid, `Err(SignatureError)` otherwise
pub fn verify_with_domain(
    public_key: &VerifyingKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    public_key
        .verify_strict(&prefixed(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Sign a canonical message payload, returning the signature as hex text.
pub fn sign_payload(keypair: &Keypair, payload: &[u8]) -> String {
    hex::encode(sign_with_domain(keypair, MESSAGE_SIGNATURE_DOMAIN, payload))
}

/// Check a hex-encoded signature over a canonical message payload.
///
/// Returns the typed reason on failure; see [`verify_payload`] for the
/// boolean form used on the delivery path.
pub fn check_payload(
    payload: &[u8],
    signature: &str,
    public_key: &VerifyingKey,
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let raw = hex::decode(signature).map_err(|_| SignatureError::InvalidEncoding)?;
    verify_with_domain(public_key, MESSAGE_SIGNATURE_DOMAIN, payload, &raw)
}

/// Verify a hex-encoded signature over a canonical message payload.
///
/// A failed verification is an expected outcome in an open membership model,
/// so this returns `false` rather than an error.
pub fn verify_payload(payload: &[u8], signature: &str, public_key: &VerifyingKey) -> bool {
    check_payload(payload, signature, public_key).is_ok()
}
