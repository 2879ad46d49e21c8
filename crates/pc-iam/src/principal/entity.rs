//! Principal Entity
//!
//! A user identity living in the global scope or an org scope. `version`
//! is the optimistic-concurrency token and moves on every update and on
//! every change to the set of owned accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::error::{PlatformError, Result};
use crate::store::{Resource, SqlValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub public_id: String,
    pub scope_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: u32,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Principal {
    pub fn new(scope_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            public_id: String::new(),
            scope_id: scope_id.into(),
            name: None,
            description: None,
            version: 1,
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

impl Resource for Principal {
    const TABLE: &'static str = "iam_principal";
    const RESOURCE_TYPE: &'static str = "principal";
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

const MUTABLE_FIELDS: &[&str] = &["Name", "Description"];

/// Normalize update paths to their canonical field names.
///
/// Paths match case-insensitively. Anything outside the mutable set,
/// including immutable fields such as `CreateTime` or `ScopeId`, is
/// rejected naming the offending path.
pub fn parse_field_mask<S: AsRef<str>>(paths: &[S]) -> Result<Vec<&'static str>> {
    if paths.is_empty() {
        return Err(PlatformError::empty_field_mask());
    }
    let mut fields = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let field = MUTABLE_FIELDS
            .iter()
            .find(|f| f.eq_ignore_ascii_case(path.trim()))
            .ok_or_else(|| PlatformError::invalid_field_mask(path))?;
        if !fields.contains(field) {
            fields.push(*field);
        }
    }
    Ok(fields)
}

/// Options for `lookup_principal_with_login` when a principal has to be
/// created for an unowned account.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ErrorKind;

    #[test]
    fn test_field_mask_parsing() {
        assert_eq!(parse_field_mask(&["name"]).unwrap(), vec!["Name"]);
        assert_eq!(
            parse_field_mask(&["Description", "NAME", "name"]).unwrap(),
            vec!["Description", "Name"]
        );
    }

    #[test]
    fn test_empty_field_mask() {
        let empty: [&str; 0] = [];
        assert_eq!(parse_field_mask(&empty).unwrap_err().kind(), ErrorKind::EmptyFieldMask);
    }

    #[test]
    fn test_immutable_and_unknown_fields() {
        for path in ["CreateTime", "ScopeId", "Version", "PublicId", "Colour"] {
            let err = parse_field_mask(&["Name", path]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFieldMask);
            assert!(err.to_string().contains(path));
        }
    }

    #[test]
    fn test_new_principal_starts_at_version_one() {
        let p = Principal::new("global").with_name("alice");
        assert_eq!(p.version, 1);
        assert!(p.public_id.is_empty());
    }
}
