//! Cryptographic utilities
//!
//! SHA-256 hashing for proof-of-work and merkle commitments, plus the ed25519
//! node identity used to sign gossip messages.

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 of `data`, hex-encoded
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// SHA-256 applied twice (the second pass hashes the raw first digest)
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Double SHA-256 of `data`, hex-encoded
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// Node identity: an ed25519 keypair whose public key is the node id
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_seed(seed)
    }

    /// Restore an identity from its 32-byte secret seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Restore an identity from a hex-encoded seed
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| Error::crypto(format!("Invalid identity seed hex: {}", e)))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            Error::crypto(format!(
                "Invalid identity seed length: expected 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Node id: the hex-encoded public key
    pub fn node_id(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Hex-encoded secret seed
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Sign `data`, returning a hex signature
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id())
            .finish()
    }
}

/// Whether `node_id` looks like an ed25519 public key we can verify against
pub fn is_verifiable_node_id(node_id: &str) -> bool {
    node_id.len() == 64 && node_id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Verify a hex signature over `data` made by the hex public key `node_id`
pub fn verify_signature(node_id: &str, data: &[u8], signature_hex: &str) -> Result<()> {
    let key_bytes: [u8; 32] = hex::decode(node_id)
        .map_err(|e| Error::crypto(format!("Invalid public key hex: {}", e)))?
        .try_into()
        .map_err(|_| Error::crypto("Public key must be 32 bytes"))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::crypto(format!("Invalid public key: {}", e)))?;

    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| Error::crypto(format!("Invalid signature hex: {}", e)))?
        .try_into()
        .map_err(|_| Error::crypto("Signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    key.verify(data, &signature)
        .map_err(|e| Error::crypto(format!("Signature verification failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_double_sha256_vectors() {
        assert_eq!(
            double_sha256_hex(b""),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
        assert_eq!(
            double_sha256_hex(b"Hello World"),
            "42a873ac3abd02122d27e80486c6fa1ef78694e8505fcec9cbcc8a7728ba8949"
        );
    }

    #[test]
    fn test_identity_sign_verify() {
        let identity = NodeIdentity::generate();
        let node_id = identity.node_id();
        assert!(is_verifiable_node_id(&node_id));

        let signature = identity.sign(b"fingerprint");
        assert!(verify_signature(&node_id, b"fingerprint", &signature).is_ok());
        assert!(verify_signature(&node_id, b"tampered", &signature).is_err());
    }

    #[test]
    fn test_identity_seed_roundtrip() {
        let identity = NodeIdentity::generate();
        let restored = NodeIdentity::from_seed_hex(&identity.seed_hex()).unwrap();
        assert_eq!(identity.node_id(), restored.node_id());

        assert!(NodeIdentity::from_seed_hex("abcd").is_err());
        assert!(NodeIdentity::from_seed_hex("not hex").is_err());
    }

    #[test]
    fn test_distinct_identities() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.node_id(), b.node_id());
    }
}
