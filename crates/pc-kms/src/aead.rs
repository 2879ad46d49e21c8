//! AES-256-GCM envelope wrapper

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{KmsError, Wrapper};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Serialized form of a sealed blob. Both byte fields are `nonce || ciphertext`.
#[derive(Serialize, Deserialize)]
struct Envelope {
    key_id: String,
    wrapped_key: String,
    ciphertext: String,
}

/// Envelope wrapper holding one AES-256 root key in memory.
pub struct AeadWrapper {
    key_id: String,
    root: Aes256Gcm,
}

impl AeadWrapper {
    /// Build from a base64-encoded 32-byte root key.
    pub fn new(key_id: impl Into<String>, encoded_key: &str) -> Result<Self, KmsError> {
        let key_bytes = BASE64
            .decode(encoded_key.trim())
            .map_err(|e| KmsError::InvalidKey(format!("Invalid base64 key: {}", e)))?;
        Self::from_bytes(key_id, &key_bytes)
    }

    pub fn from_bytes(key_id: impl Into<String>, key: &[u8]) -> Result<Self, KmsError> {
        let key_id = key_id.into();
        if key_id.is_empty() {
            return Err(KmsError::InvalidKey("key id is empty".to_string()));
        }
        Ok(Self {
            key_id,
            root: cipher_for(key)?,
        })
    }
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, KmsError> {
    if key.len() != KEY_LEN {
        return Err(KmsError::InvalidKey(format!(
            "Key must be {} bytes, got {}",
            KEY_LEN,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| KmsError::InvalidKey(e.to_string()))
}

fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| KmsError::EncryptionError(e.to_string()))?;

    let mut output = nonce_bytes.to_vec();
    output.extend(ciphertext);
    Ok(output)
}

fn open(cipher: &Aes256Gcm, sealed: &[u8]) -> Result<Vec<u8>, KmsError> {
    if sealed.len() <= NONCE_LEN {
        return Err(KmsError::DecryptionError("sealed data too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| KmsError::DecryptionError(e.to_string()))
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, KmsError> {
    BASE64
        .decode(value)
        .map_err(|e| KmsError::DecryptionError(format!("{} is not base64: {}", field, e)))
}

#[async_trait]
impl Wrapper for AeadWrapper {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let mut data_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut data_key);

        let ciphertext = seal(&cipher_for(&data_key)?, plaintext)?;
        let wrapped_key = seal(&self.root, &data_key)?;
        data_key.fill(0);

        let envelope = Envelope {
            key_id: self.key_id.clone(),
            wrapped_key: BASE64.encode(wrapped_key),
            ciphertext: BASE64.encode(ciphertext),
        };
        debug!(key_id = %self.key_id, bytes = plaintext.len(), "Sealed envelope");
        Ok(serde_json::to_vec(&envelope)?)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let envelope: Envelope = serde_json::from_slice(ciphertext)?;
        if envelope.key_id != self.key_id {
            return Err(KmsError::KeyMismatch {
                expected: self.key_id.clone(),
                found: envelope.key_id,
            });
        }

        let mut data_key = open(&self.root, &decode_field(&envelope.wrapped_key, "wrapped_key")?)?;
        let plaintext = open(
            &cipher_for(&data_key)?,
            &decode_field(&envelope.ciphertext, "ciphertext")?,
        );
        data_key.fill(0);
        plaintext
    }
}

/// Generate a new base64-encoded root key
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}
