//! Oplog Repository

use crate::oplog::{OpType, OplogEntry};
use crate::shared::error::Result;
use crate::store::Store;

pub struct OplogRepository {
    store: Store,
}

impl OplogRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// All entries for an entity, oldest first.
    pub async fn list_for_entity(&self, entity_id: &str) -> Result<Vec<OplogEntry>> {
        let entries = sqlx::query_as::<_, OplogEntry>(
            "SELECT * FROM oplog_entry WHERE entity_id = ? ORDER BY id",
        )
        .bind(entity_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(entries)
    }

    /// Entries for an entity filtered by resource type and operation.
    pub async fn count_for_entity(
        &self,
        entity_id: &str,
        resource_type: &str,
        op: OpType,
    ) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM oplog_entry WHERE entity_id = ? AND resource_type = ? AND op_type = ?",
        )
        .bind(entity_id)
        .bind(resource_type)
        .bind(op.as_str())
        .fetch_one(self.store.pool())
        .await?;
        Ok(n)
    }

    /// Every entry written by one transaction.
    pub async fn list_for_tx(&self, tx_id: &str) -> Result<Vec<OplogEntry>> {
        let entries = sqlx::query_as::<_, OplogEntry>(
            "SELECT * FROM oplog_entry WHERE tx_id = ? ORDER BY id",
        )
        .bind(tx_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(entries)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oplog_entry")
            .fetch_one(self.store.pool())
            .await?;
        Ok(n)
    }
}
