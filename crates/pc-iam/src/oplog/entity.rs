//! Oplog Entity
//!
//! One row per entity mutation, written in the mutation's transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::shared::error::{PlatformError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OpType::Create),
            "update" => Some(OpType::Update),
            "delete" => Some(OpType::Delete),
            _ => None,
        }
    }
}

/// Multi-valued key/value annotations attached to an oplog entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OplogMetadata(BTreeMap<String, Vec<String>>);

impl OplogMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// First value for a key
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(String::as_str)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OplogEntry {
    pub id: i64,
    pub tx_id: String,
    pub entity_id: String,
    pub resource_type: String,
    pub op_type: String,
    pub metadata: String,
    pub actor_id: Option<String>,
    pub correlation_id: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl OplogEntry {
    pub fn op(&self) -> Option<OpType> {
        OpType::parse(&self.op_type)
    }

    pub fn metadata(&self) -> Result<OplogMetadata> {
        serde_json::from_str(&self.metadata).map_err(|e| {
            PlatformError::internal(format!("oplog entry {} metadata: {}", self.id, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_strings() {
        for op in [OpType::Create, OpType::Update, OpType::Delete] {
            assert_eq!(OpType::parse(op.as_str()), Some(op));
        }
        assert_eq!(OpType::parse("CREATE"), None);
    }

    #[test]
    fn test_metadata_accumulates_values() {
        let meta = OplogMetadata::new()
            .with("scope-id", "o_1")
            .with("account-id", "acctpw_1")
            .with("account-id", "acctpw_2");
        assert_eq!(meta.first("scope-id"), Some("o_1"));
        assert_eq!(meta.get("account-id").map(|v| v.len()), Some(2));
        assert!(meta.get("missing").is_none());

        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.starts_with("{\"account-id\""));
    }
}
