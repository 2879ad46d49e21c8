//! Reader and writer handles
//!
//! [`Tx`] is the read/write handle passed to a [`Store::do_tx`] callback.
//! Every write can carry oplog metadata; the oplog row is inserted through
//! the same connection, so it commits or rolls back with the write.
//! [`Reader`] offers the read half against the pool for lookups that do not
//! need to be consistent with a write.
//!
//! [`Store::do_tx`]: super::Store::do_tx

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, error};

use super::resource::{bind_values, Limit, Resource, SqlValue};
use crate::oplog::{OpType, OplogMetadata};
use crate::shared::error::{PlatformError, Result};
use crate::shared::ExecutionContext;

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `column IN (?, ?, ...)` for `n` values. `n` must be non-zero.
pub fn in_clause(column: &str, n: usize) -> String {
    format!("{} IN ({})", column, placeholders(n))
}

async fn lookup<'e, E, R>(executor: E, public_id: &str) -> Result<Option<R>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
    R: Resource,
{
    let sql = format!("SELECT * FROM {} WHERE {} = ?", R::TABLE, R::KEY_COLUMN);
    let row = sqlx::query_as::<_, R>(&sql)
        .bind(public_id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

async fn search<'e, E, R>(
    executor: E,
    where_clause: &str,
    args: Vec<SqlValue>,
    limit: Limit,
) -> Result<Vec<R>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
    R: Resource,
{
    let sql = format!(
        "SELECT * FROM {} WHERE {} LIMIT {}",
        R::TABLE,
        where_clause,
        limit.as_sql()
    );
    let rows = bind_values!(sqlx::query_as::<_, R>(&sql), args)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

async fn count<'e, E, R>(executor: E, public_id: &str) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
    R: Resource,
{
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {} = ?", R::TABLE, R::KEY_COLUMN);
    let n: i64 = sqlx::query_scalar(&sql)
        .bind(public_id)
        .fetch_one(executor)
        .await?;
    Ok(n)
}

/// Read handle over the connection pool.
#[derive(Clone, Copy)]
pub struct Reader<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn lookup_by_public_id<R: Resource>(&self, public_id: &str) -> Result<Option<R>> {
        lookup::<_, R>(self.pool, public_id).await
    }

    pub async fn search_where<R: Resource>(
        &self,
        where_clause: &str,
        args: Vec<SqlValue>,
        limit: Limit,
    ) -> Result<Vec<R>> {
        search::<_, R>(self.pool, where_clause, args, limit).await
    }
}

/// Read/write handle scoped to one database transaction.
pub struct Tx {
    inner: Transaction<'static, Sqlite>,
    tx_id: String,
    actor_id: String,
    correlation_id: String,
    oplog_entries: usize,
}

impl Tx {
    pub(crate) fn new(inner: Transaction<'static, Sqlite>, ctx: &ExecutionContext, tx_id: String) -> Self {
        Self {
            inner,
            tx_id,
            actor_id: ctx.principal_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            oplog_entries: 0,
        }
    }

    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    pub(crate) async fn commit(self) -> Result<()> {
        let tx_id = self.tx_id;
        let entries = self.oplog_entries;
        if let Err(e) = self.inner.commit().await {
            error!(tx_id = %tx_id, "Failed to commit transaction: {}", e);
            return Err(PlatformError::from(e).context("commit"));
        }
        debug!(tx_id = %tx_id, oplog_entries = entries, "Successfully committed transaction");
        Ok(())
    }

    pub(crate) async fn rollback(self) -> Result<()> {
        self.inner.rollback().await?;
        Ok(())
    }

    pub async fn lookup_by_public_id<R: Resource>(&mut self, public_id: &str) -> Result<Option<R>> {
        lookup::<_, R>(&mut *self.inner, public_id).await
    }

    pub async fn search_where<R: Resource>(
        &mut self,
        where_clause: &str,
        args: Vec<SqlValue>,
        limit: Limit,
    ) -> Result<Vec<R>> {
        search::<_, R>(&mut *self.inner, where_clause, args, limit).await
    }

    /// Whether a row with this key exists, as seen by this transaction.
    pub async fn exists<R: Resource>(&mut self, public_id: &str) -> Result<bool> {
        Ok(count::<_, R>(&mut *self.inner, public_id).await? > 0)
    }

    /// Run a raw statement, returning the affected row count.
    pub async fn execute(&mut self, sql: &str, args: Vec<SqlValue>) -> Result<u64> {
        let result = bind_values!(sqlx::query(sql), args)
            .execute(&mut *self.inner)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn create<R: Resource>(
        &mut self,
        resource: &R,
        oplog: Option<OplogMetadata>,
    ) -> Result<()> {
        let columns = resource.columns();
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            R::TABLE,
            names.join(", "),
            placeholders(names.len())
        );
        let rows = self
            .execute(&sql, columns.into_iter().map(|(_, v)| v).collect())
            .await?;
        if rows != 1 {
            return Err(PlatformError::internal(format!(
                "create {}: inserted {} rows",
                R::RESOURCE_TYPE,
                rows
            )));
        }

        if let Some(metadata) = oplog {
            self.write_oplog::<R>(resource.public_id(), OpType::Create, metadata)
                .await?;
        }
        Ok(())
    }

    /// Update the masked fields of `resource`, optionally conditioned on
    /// the stored version. Versioned resources get `version + 1`.
    pub async fn update<R: Resource>(
        &mut self,
        resource: &R,
        field_mask: &[&str],
        expected_version: Option<u32>,
        oplog: Option<OplogMetadata>,
    ) -> Result<u64> {
        if field_mask.is_empty() {
            return Err(PlatformError::empty_field_mask());
        }

        let mut assignments = Vec::with_capacity(field_mask.len() + 2);
        let mut args = Vec::with_capacity(field_mask.len() + 3);
        for field in field_mask {
            let (column, value) = resource
                .mutable_column(field)
                .ok_or_else(|| PlatformError::invalid_field_mask(*field))?;
            assignments.push(format!("{} = ?", column));
            args.push(value);
        }
        if R::VERSIONED {
            assignments.push("version = version + 1".to_string());
        }
        assignments.push("update_time = ?".to_string());
        args.push(Utc::now().into());

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            R::TABLE,
            assignments.join(", "),
            R::KEY_COLUMN
        );
        args.push(resource.public_id().into());

        if let Some(version) = expected_version {
            if !R::VERSIONED {
                return Err(PlatformError::invalid_parameter(format!(
                    "{} is not versioned",
                    R::RESOURCE_TYPE
                )));
            }
            sql.push_str(" AND version = ?");
            args.push(version.into());
        }

        let rows = self.execute(&sql, args).await?;
        if rows > 0 {
            if let Some(metadata) = oplog {
                self.write_oplog::<R>(resource.public_id(), OpType::Update, metadata)
                    .await?;
            }
        }
        Ok(rows)
    }

    pub async fn delete<R: Resource>(
        &mut self,
        resource: &R,
        oplog: Option<OplogMetadata>,
    ) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", R::TABLE, R::KEY_COLUMN);
        let rows = self
            .execute(&sql, vec![resource.public_id().into()])
            .await?;
        if rows > 0 {
            if let Some(metadata) = oplog {
                self.write_oplog::<R>(resource.public_id(), OpType::Delete, metadata)
                    .await?;
            }
        }
        Ok(rows)
    }

    /// Append an oplog entry for a resource of type `R`.
    pub async fn write_oplog<R: Resource>(
        &mut self,
        entity_id: &str,
        op: OpType,
        metadata: OplogMetadata,
    ) -> Result<()> {
        self.append_oplog(entity_id, R::RESOURCE_TYPE, op, metadata).await
    }

    async fn append_oplog(
        &mut self,
        entity_id: &str,
        resource_type: &str,
        op: OpType,
        metadata: OplogMetadata,
    ) -> Result<()> {
        let metadata = metadata
            .with("resource-public-id", entity_id)
            .with("resource-type", resource_type)
            .with("op-type", op.as_str());

        sqlx::query(
            r#"
            INSERT INTO oplog_entry
                (tx_id, entity_id, resource_type, op_type, metadata, actor_id, correlation_id, create_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.tx_id)
        .bind(entity_id)
        .bind(resource_type)
        .bind(op.as_str())
        .bind(serde_json::to_string(&metadata)?)
        .bind(&self.actor_id)
        .bind(&self.correlation_id)
        .bind(Utc::now())
        .execute(&mut *self.inner)
        .await?;

        self.oplog_entries += 1;
        Ok(())
    }
}
