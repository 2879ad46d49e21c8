//! Portcullis Key Management
//!
//! Envelope encryption for data at rest. Each call to
//! [`Wrapper::encrypt`] generates a fresh data key, encrypts the payload
//! with it, and stores the data key encrypted under the wrapper's root key
//! alongside the ciphertext. Root keys are provisioned and rotated outside
//! this crate; the blob records which root key id sealed it.

use async_trait::async_trait;
use thiserror::Error;

mod aead;

pub use aead::{generate_key, AeadWrapper};

#[derive(Error, Debug)]
pub enum KmsError {
    #[error("Invalid key format: {0}")]
    InvalidKey(String),
    #[error("Encryption error: {0}")]
    EncryptionError(String),
    #[error("Decryption error: {0}")]
    DecryptionError(String),
    #[error("Blob sealed with key {found}, wrapper holds {expected}")]
    KeyMismatch { expected: String, found: String },
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

/// An envelope-encryption service.
///
/// Implementations must be safe for concurrent use; callers share one
/// instance behind an `Arc`.
#[async_trait]
pub trait Wrapper: Send + Sync {
    /// Id of the root key new blobs are sealed with
    fn key_id(&self) -> &str;

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
}
