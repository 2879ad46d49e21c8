//! Scope Entity
//!
//! Scopes form a three-level tree: the single global scope, orgs under
//! it, and projects under an org. Names are unique among siblings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Resource, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScopeType {
    Global,
    Org,
    Project,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Org => "org",
            ScopeType::Project => "project",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub public_id: String,
    pub parent_id: Option<String>,
    pub scope_type: ScopeType,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Auth method whose unowned accounts get a principal on first login.
    pub primary_auth_method_id: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Scope {
    fn new(scope_type: ScopeType, parent_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            public_id: String::new(),
            parent_id,
            scope_type,
            name: None,
            description: None,
            primary_auth_method_id: None,
            create_time: now,
            update_time: now,
        }
    }

    /// An org; its parent is always the global scope.
    pub fn org() -> Self {
        Self::new(ScopeType::Org, None)
    }

    pub fn project(org_id: impl Into<String>) -> Self {
        Self::new(ScopeType::Project, Some(org_id.into()))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether a login through `auth_method_id` may create a principal.
    pub fn vivifies_for(&self, auth_method_id: &str) -> bool {
        self.primary_auth_method_id.as_deref() == Some(auth_method_id)
    }

    /// Principals may be created in global and org scopes only.
    pub fn can_hold_principals(&self) -> bool {
        self.scope_type != ScopeType::Project
    }
}

impl Resource for Scope {
    const TABLE: &'static str = "iam_scope";
    const RESOURCE_TYPE: &'static str = "scope";

    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("public_id", self.public_id.as_str().into()),
            ("parent_id", self.parent_id.clone().into()),
            ("scope_type", self.scope_type.as_str().into()),
            ("name", SqlValue::optional_text(&self.name)),
            ("description", SqlValue::optional_text(&self.description)),
            ("primary_auth_method_id", SqlValue::optional_text(&self.primary_auth_method_id)),
            ("create_time", self.create_time.into()),
            ("update_time", self.update_time.into()),
        ]
    }

    fn mutable_column(&self, field: &str) -> Option<(&'static str, SqlValue)> {
        match field {
            "Name" => Some(("name", SqlValue::optional_text(&self.name))),
            "Description" => Some(("description", SqlValue::optional_text(&self.description))),
            "PrimaryAuthMethodId" => Some((
                "primary_auth_method_id",
                SqlValue::optional_text(&self.primary_auth_method_id),
            )),
            _ => None,
        }
    }
}
