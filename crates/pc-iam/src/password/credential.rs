//! Password Credentials
//!
//! Argon2id key derivation plus envelope encryption. The derived key, its
//! salt and the cost parameters are serialized together and sealed by the
//! KMS wrapper; only the sealed blob is persisted.

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

use pc_kms::Wrapper;

use crate::password::auth_method::Configuration;
use crate::shared::error::{PlatformError, Result};
use crate::store::{Resource, SqlValue};

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2Params {
    pub iterations: u32,
    /// Memory cost in KiB
    pub memory: u32,
    pub threads: u32,
    pub salt_length: u32,
    pub key_length: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory: 64 * 1024, // 64 MiB
            threads: 1,
            salt_length: 32,
            key_length: 32,
        }
    }
}

impl Argon2Params {
    /// Low memory config for testing (faster but less secure)
    pub fn testing() -> Self {
        Self {
            iterations: 1,
            memory: 1024,
            threads: 1,
            salt_length: 16,
            key_length: 32,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.salt_length < 8 {
            return Err(PlatformError::invalid_parameter(format!(
                "argon2 salt length {} is below 8 bytes",
                self.salt_length
            )));
        }
        self.to_params().map(|_| ())
    }

    fn to_params(&self) -> Result<Params> {
        Params::new(
            self.memory,
            self.iterations,
            self.threads,
            Some(self.key_length as usize),
        )
        .map_err(|e| PlatformError::invalid_parameter(format!("invalid argon2 params: {}", e)))
    }

    fn hash(&self, password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.to_params()?);
        let mut key = vec![0u8; self.key_length as usize];
        argon2
            .hash_password_into(password, salt, &mut key)
            .map_err(|e| PlatformError::internal(format!("failed to derive key: {}", e)))?;
        Ok(key)
    }
}

/// Argon2 is CPU and memory bound; keep it off the async workers.
async fn derive_key(password: String, salt: Vec<u8>, params: Argon2Params) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || params.hash(password.as_bytes(), &salt))
        .await
        .map_err(|e| PlatformError::internal(format!("key derivation task failed: {}", e)))?
}

/// Plaintext form of the sealed blob.
#[derive(Serialize, Deserialize)]
struct SealedKey {
    derived_key: Vec<u8>,
    salt: Vec<u8>,
    params: Argon2Params,
}

/// A password credential, owned 1:1 by a password account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub password_account_id: String,
    pub password_method_id: String,
    #[serde(skip)]
    pub ct_credential: Vec<u8>,
    /// KMS root key that sealed `ct_credential`
    pub key_id: String,
    pub iterations: u32,
    pub memory: u32,
    pub threads: u32,
    pub key_length: u32,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Credential {
    /// Derive and seal a credential for `account_id` under the given
    /// auth-method configuration.
    pub async fn derive(
        wrapper: &Arc<dyn Wrapper>,
        account_id: &str,
        auth_method_id: &str,
        password: &str,
        config: &Configuration,
    ) -> Result<Self> {
        if account_id.is_empty() || auth_method_id.is_empty() {
            return Err(PlatformError::invalid_parameter(
                "credential requires an account id and an auth method id",
            ));
        }
        // Measured in bytes, so multi-byte characters count more than once.
        let length = password.len();
        if length < config.min_password_length as usize {
            return Err(PlatformError::too_short(format!(
                "password must be at least {} bytes, got {}",
                config.min_password_length, length
            )));
        }

        let params = config.argon2;
        params.validate()?;

        let mut salt = vec![0u8; params.salt_length as usize];
        rand::thread_rng().fill_bytes(&mut salt);

        let derived_key = derive_key(password.to_string(), salt.clone(), params).await?;
        let sealed = serde_json::to_vec(&SealedKey {
            derived_key,
            salt,
            params,
        })?;
        let ct_credential = wrapper.encrypt(&sealed).await?;

        debug!(account_id, key_id = wrapper.key_id(), "Password credential derived");

        let now = Utc::now();
        Ok(Self {
            password_account_id: account_id.to_string(),
            password_method_id: auth_method_id.to_string(),
            ct_credential,
            key_id: wrapper.key_id().to_string(),
            iterations: params.iterations,
            memory: params.memory,
            threads: params.threads,
            key_length: params.key_length,
            create_time: now,
            update_time: now,
        })
    }

    /// Recompute the key over `candidate` with the stored salt and params
    /// and compare in constant time.
    pub async fn verify(&self, wrapper: &Arc<dyn Wrapper>, candidate: &str) -> Result<bool> {
        let plaintext = wrapper.decrypt(&self.ct_credential).await?;
        let sealed: SealedKey = serde_json::from_slice(&plaintext)?;

        let candidate_key =
            derive_key(candidate.to_string(), sealed.salt, sealed.params).await?;
        Ok(bool::from(candidate_key.ct_eq(&sealed.derived_key)))
    }
}

impl Resource for Credential {
    const TABLE: &'static str = "auth_password_credential";
    const KEY_COLUMN: &'static str = "password_account_id";
    const RESOURCE_TYPE: &'static str = "password-credential";

    fn public_id(&self) -> &str {
        &self.password_account_id
    }

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("password_account_id", self.password_account_id.as_str().into()),
            ("password_method_id", self.password_method_id.as_str().into()),
            ("ct_credential", self.ct_credential.clone().into()),
            ("key_id", self.key_id.as_str().into()),
            ("iterations", self.iterations.into()),
            ("memory", self.memory.into()),
            ("threads", self.threads.into()),
            ("key_length", self.key_length.into()),
            ("create_time", self.create_time.into()),
            ("update_time", self.update_time.into()),
        ]
    }

    /// Credentials are replaced, never patched.
    fn mutable_column(&self, _field: &str) -> Option<(&'static str, SqlValue)> {
        None
    }
}
