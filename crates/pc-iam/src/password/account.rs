//! Password Account Entity

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::shared::error::{PlatformError, Result};
use crate::store::{Resource, SqlValue};

/// A login identity under a password auth method. At most one principal
/// owns an account at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub public_id: String,
    pub auth_method_id: String,
    /// Copied from the auth method on create
    pub scope_id: String,
    pub principal_id: Option<String>,
    pub user_name: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Account {
    pub fn new(auth_method_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            public_id: String::new(),
            auth_method_id: auth_method_id.into(),
            scope_id: String::new(),
            principal_id: None,
            user_name: user_name.into(),
            name: None,
            description: None,
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
}

impl Resource for Account {
    const TABLE: &'static str = "auth_password_account";
    const RESOURCE_TYPE: &'static str = "password-account";

    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("public_id", self.public_id.as_str().into()),
            ("auth_method_id", self.auth_method_id.as_str().into()),
            ("scope_id", self.scope_id.as_str().into()),
            ("principal_id", self.principal_id.clone().into()),
            ("user_name", self.user_name.as_str().into()),
            ("name", SqlValue::optional_text(&self.name)),
            ("description", SqlValue::optional_text(&self.description)),
            ("create_time", self.create_time.into()),
            ("update_time", self.update_time.into()),
        ]
    }

    fn mutable_column(&self, field: &str) -> Option<(&'static str, SqlValue)> {
        match field {
            "Name" => Some(("name", SqlValue::optional_text(&self.name))),
            "Description" => Some(("description", SqlValue::optional_text(&self.description))),
            _ => None,
        }
    }
}

/// Options for `create_account`
#[derive(Debug, Clone, Default)]
pub struct CreateAccountOptions {
    /// Derive and store a credential in the same transaction
    pub password: Option<String>,
}

impl CreateAccountOptions {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }
}

/// Options for list operations
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// `None` uses the repository default, zero or negative is unbounded
    pub limit: Option<i64>,
}

impl ListOptions {
    pub fn with_limit(limit: i64) -> Self {
        Self { limit: Some(limit) }
    }
}

fn user_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9.]+$").unwrap())
}

/// Character-class check. Length is checked against the auth method's
/// configuration inside the create transaction.
pub(crate) fn validate_user_name(user_name: &str) -> Result<()> {
    if user_name.is_empty() {
        return Err(PlatformError::invalid_parameter("missing user name"));
    }
    if !user_name_pattern().is_match(user_name) {
        return Err(PlatformError::invalid_parameter(format!(
            "invalid user name {:?}: only lowercase letters, digits and '.' are allowed",
            user_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ErrorKind;

    #[test]
    fn test_user_name_character_class() {
        assert!(validate_user_name("alice.smith").is_ok());
        assert!(validate_user_name("bob42").is_ok());

        for bad in ["", "Alice", "alice smith", "alice_smith", "al!ce", "élise"] {
            let err = validate_user_name(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameter, "{:?}", bad);
        }
    }

    #[test]
    fn test_list_options() {
        assert_eq!(ListOptions::default().limit, None);
        assert_eq!(ListOptions::with_limit(5).limit, Some(5));
    }
}
