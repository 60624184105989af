//! # Peer Identity
//!
//! This module defines the identity types used throughout peerchat:
//!
//! - [`PeerId`]: human-chosen, stable identifier a peer registers under
//! - [`Keypair`]: Ed25519 signing keypair, generated fresh on every start
//!
//! ## Identity Model
//!
//! Unlike a self-certifying overlay, a peer's *name* and its *key* are separate
//! here: the [`Directory`](crate::directory::Directory) binds a `PeerId` to the
//! public key that peer registered with. That binding is the only trust anchor
//! used when verifying a message, so a peer that is absent from the directory
//! cannot have any message accepted as authentic.
//!
//! ## Security Invariants
//!
//! - A keypair is generated from OS randomness; failure is fatal, never retried
//! - The secret key never leaves [`Keypair`] (no accessor exposes it)
//! - `Debug` output of a keypair shows only the public half

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Returns current time as milliseconds since Unix epoch.
/// Used for message timestamps.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Peer Identifier
// ============================================================================

/// Stable identifier of a peer inside one directory.
///
/// Set at construction and never changed. No two *running* peers may share
/// the same id within a directory.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes, used when building signed payloads.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// Error type for keypair generation failures.
///
/// The OS random source refused to produce bytes. There is nothing a peer can
/// do about this at runtime, so callers treat it as fatal configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityError {
    /// Reason reported by the random source.
    pub reason: String,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keypair generation failed: {}", self.reason)
    }
}

impl std::error::Error for IdentityError {}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from OS randomness.
    ///
    /// # Errors
    /// Returns `Err(IdentityError)` if the OS random source is unavailable.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut secret = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| IdentityError { reason: e.to_string() })?;
        Ok(Self::from_secret_key_bytes(&secret))
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}
