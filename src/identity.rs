//! # Node Identity
//!
//! This module defines the identity types persisted in a node repository:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`KeyAlgorithm`]: the key algorithm recorded in the config
//! - [`IdentityRecord`]: the `Identity` section of the config file
//! - [`KeyProtector`]: how the private key is sealed at rest
//!
//! ## Identity Model
//!
//! The peer id is derived from the Ed25519 public key (libp2p identity
//! multihash). A repository holds exactly one identity; it is generated on
//! first initialization and never rewritten.
//!
//! ## Key Storage
//!
//! `Identity.PrivKey` holds the protobuf encoding of the libp2p private key,
//! passed through a [`KeyProtector`]. [`Unprotected`] stores it as plain
//! base64, which is what other libp2p/IPFS tooling reads. Passphrase-based
//! schemes plug in by implementing [`KeyProtector`]; decoding always verifies
//! that the opened key matches the recorded `PeerID`.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::SigningKey;
use libp2p::PeerId;
use libp2p::identity::{self, KeyType};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::IdentityError;

/// Key algorithm used for the node identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Generate a keypair for the configured algorithm.
    pub fn generate_for(algorithm: KeyAlgorithm) -> Self {
        match algorithm {
            KeyAlgorithm::Ed25519 => Self::generate(),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Ed25519
    }

    /// The libp2p view of this keypair, used to build the swarm.
    pub fn to_libp2p(&self) -> identity::Keypair {
        identity::Keypair::ed25519_from_bytes(self.secret_key_bytes())
            .expect("a 32-byte ed25519 secret is always a valid libp2p key")
    }

    pub fn peer_id(&self) -> PeerId {
        self.to_libp2p().public().to_peer_id()
    }

    fn from_libp2p(keypair: identity::Keypair) -> Result<Self, IdentityError> {
        let key_type = keypair.key_type();
        let ed25519 = keypair
            .try_into_ed25519()
            .map_err(|_| IdentityError::AlgorithmMismatch {
                expected: KeyAlgorithm::Ed25519.as_str(),
                found: key_type_name(key_type),
            })?;
        let secret = ed25519.secret();
        let bytes: [u8; 32] = secret
            .as_ref()
            .try_into()
            .map_err(|_| IdentityError::Decode("ed25519 secret is not 32 bytes".to_string()))?;
        Ok(Self::from_secret_key_bytes(&bytes))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn key_type_name(key_type: KeyType) -> String {
    format!("{key_type:?}").to_lowercase()
}

// ============================================================================
// Key Protection
// ============================================================================

/// Seals and opens the private key stored in `Identity.PrivKey`.
///
/// `seal` receives the protobuf-encoded libp2p private key and returns the
/// string written to the config file; `open` is its inverse. A protector that
/// needs a passphrase reports a wrong or missing one as
/// [`IdentityError::Protector`].
pub trait KeyProtector: Send + Sync {
    fn seal(&self, encoded_key: &[u8]) -> Result<String, IdentityError>;

    fn open(&self, sealed: &str) -> Result<Vec<u8>, IdentityError>;
}

/// Stores the key as base64 without encryption.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unprotected;

impl KeyProtector for Unprotected {
    fn seal(&self, encoded_key: &[u8]) -> Result<String, IdentityError> {
        Ok(BASE64.encode(encoded_key))
    }

    fn open(&self, sealed: &str) -> Result<Vec<u8>, IdentityError> {
        BASE64
            .decode(sealed.trim())
            .map_err(|e| IdentityError::Decode(format!("invalid base64: {e}")))
    }
}

// ============================================================================
// Persisted Identity
// ============================================================================

/// The `Identity` section of the repository config.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    #[serde(rename = "PrivKey")]
    pub private_key: String,
}

impl IdentityRecord {
    /// Generate a fresh identity for `algorithm` and seal its key.
    pub fn generate(
        algorithm: KeyAlgorithm,
        protector: &dyn KeyProtector,
    ) -> Result<Self, IdentityError> {
        let keypair = Keypair::generate_for(algorithm);
        let record = Self::from_keypair(&keypair, protector)?;
        info!(peer_id = %record.peer_id, algorithm = %algorithm, "generated node identity");
        Ok(record)
    }

    pub fn from_keypair(
        keypair: &Keypair,
        protector: &dyn KeyProtector,
    ) -> Result<Self, IdentityError> {
        let encoded = keypair
            .to_libp2p()
            .to_protobuf_encoding()
            .map_err(|e| IdentityError::Encode(e.to_string()))?;
        Ok(Self {
            peer_id: keypair.peer_id().to_base58(),
            private_key: protector.seal(&encoded)?,
        })
    }

    pub fn peer_id(&self) -> Result<PeerId, IdentityError> {
        PeerId::from_str(&self.peer_id).map_err(|_| IdentityError::InvalidPeerId(self.peer_id.clone()))
    }

    /// Open the stored private key and check it against the recorded peer id.
    pub fn decode_private_key(&self, protector: &dyn KeyProtector) -> Result<Keypair, IdentityError> {
        let expected = self.peer_id()?;
        let encoded = protector.open(&self.private_key)?;
        let keypair = identity::Keypair::from_protobuf_encoding(&encoded)
            .map_err(|e| IdentityError::Decode(e.to_string()))?;
        let keypair = Keypair::from_libp2p(keypair)?;

        let actual = keypair.peer_id();
        if actual != expected {
            return Err(IdentityError::PeerIdMismatch { expected, actual });
        }
        Ok(keypair)
    }
}

impl fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
