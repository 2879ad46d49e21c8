//! Password Auth Method Entity
//!
//! An auth method owns password accounts and carries the configuration
//! every account and credential operation is checked against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::password::credential::Argon2Params;
use crate::shared::error::{PlatformError, Result};
use crate::store::{Resource, SqlValue};

pub const DEFAULT_MIN_USER_NAME_LENGTH: u32 = 3;
pub const DEFAULT_MIN_PASSWORD_LENGTH: u32 = 8;

/// Policy applied to accounts of one auth method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub min_user_name_length: u32,
    pub min_password_length: u32,
    pub argon2: Argon2Params,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            min_user_name_length: DEFAULT_MIN_USER_NAME_LENGTH,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            argon2: Argon2Params::default(),
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        if self.min_user_name_length == 0 {
            return Err(PlatformError::invalid_parameter(
                "min user name length must be at least 1",
            ));
        }
        if self.min_password_length == 0 {
            return Err(PlatformError::invalid_parameter(
                "min password length must be at least 1",
            ));
        }
        self.argon2.validate()
    }
}

/// Field-mask paths that `set_configuration` writes.
pub(crate) const CONFIGURATION_FIELDS: &[&str] = &[
    "MinUserNameLength",
    "MinPasswordLength",
    "Argon2Iterations",
    "Argon2Memory",
    "Argon2Threads",
    "Argon2SaltLength",
    "Argon2KeyLength",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    pub public_id: String,
    pub scope_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: u32,
    pub min_user_name_length: u32,
    pub min_password_length: u32,
    pub argon2: Argon2Params,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl AuthMethod {
    pub fn new(scope_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let config = Configuration::default();
        Self {
            public_id: String::new(),
            scope_id: scope_id.into(),
            name: None,
            description: None,
            version: 1,
            min_user_name_length: config.min_user_name_length,
            min_password_length: config.min_password_length,
            argon2: config.argon2,
            create_time: now,
            update_time: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_configuration(mut self, config: Configuration) -> Self {
        self.apply(config);
        self
    }

    pub fn configuration(&self) -> Configuration {
        Configuration {
            min_user_name_length: self.min_user_name_length,
            min_password_length: self.min_password_length,
            argon2: self.argon2,
        }
    }

    pub(crate) fn apply(&mut self, config: Configuration) {
        self.min_user_name_length = config.min_user_name_length;
        self.min_password_length = config.min_password_length;
        self.argon2 = config.argon2;
    }
}

impl<'r> FromRow<'r, SqliteRow> for AuthMethod {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            public_id: row.try_get("public_id")?,
            scope_id: row.try_get("scope_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            version: row.try_get("version")?,
            min_user_name_length: row.try_get("min_user_name_length")?,
            min_password_length: row.try_get("min_password_length")?,
            argon2: Argon2Params {
                iterations: row.try_get("argon2_iterations")?,
                memory: row.try_get("argon2_memory")?,
                threads: row.try_get("argon2_threads")?,
                salt_length: row.try_get("argon2_salt_length")?,
                key_length: row.try_get("argon2_key_length")?,
            },
            create_time: row.try_get("create_time")?,
            update_time: row.try_get("update_time")?,
        })
    }
}

impl Resource for AuthMethod {
    const TABLE: &'static str = "auth_password_method";
    const RESOURCE_TYPE: &'static str = "password-auth-method";
    const VERSIONED: bool = true;

    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("public_id", self.public_id.as_str().into()),
            ("scope_id", self.scope_id.as_str().into()),
            ("name", SqlValue::optional_text(&self.name)),
            ("description", SqlValue::optional_text(&self.description)),
            ("version", self.version.into()),
            ("min_user_name_length", self.min_user_name_length.into()),
            ("min_password_length", self.min_password_length.into()),
            ("argon2_iterations", self.argon2.iterations.into()),
            ("argon2_memory", self.argon2.memory.into()),
            ("argon2_threads", self.argon2.threads.into()),
            ("argon2_salt_length", self.argon2.salt_length.into()),
            ("argon2_key_length", self.argon2.key_length.into()),
            ("create_time", self.create_time.into()),
            ("update_time", self.update_time.into()),
        ]
    }

    fn mutable_column(&self, field: &str) -> Option<(&'static str, SqlValue)> {
        let column = match field {
            "Name" => ("name", SqlValue::optional_text(&self.name)),
            "Description" => ("description", SqlValue::optional_text(&self.description)),
            "MinUserNameLength" => ("min_user_name_length", self.min_user_name_length.into()),
            "MinPasswordLength" => ("min_password_length", self.min_password_length.into()),
            "Argon2Iterations" => ("argon2_iterations", self.argon2.iterations.into()),
            "Argon2Memory" => ("argon2_memory", self.argon2.memory.into()),
            "Argon2Threads" => ("argon2_threads", self.argon2.threads.into()),
            "Argon2SaltLength" => ("argon2_salt_length", self.argon2.salt_length.into()),
            "Argon2KeyLength" => ("argon2_key_length", self.argon2.key_length.into()),
            _ => return None,
        };
        Some(column)
    }
}
