//! Store
//!
//! SQLite-backed transactional store. All repository writes go through
//! [`Store::do_tx`], which owns the transaction boundary, rolls back on
//! error, and retries transient storage conflicts with backoff.

pub mod backoff;
pub mod resource;
pub mod schema;
pub mod tx;

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use pc_config::DatabaseConfig;

use crate::shared::error::{PlatformError, Result, ResultExt};
use crate::shared::{new_public_id, ExecutionContext};

pub use backoff::{Backoff, ConstBackoff, ExpBackoff, RetryPolicy};
pub use resource::{Limit, Resource, SqlValue};
pub use schema::GLOBAL_SCOPE_ID;
pub use tx::{in_clause, Reader, Tx};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

impl Store {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(PlatformError::from)
            .with_context(|| format!("parse database url {}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        // Every in-memory connection is its own database, so pin to one.
        let memory = is_memory_url(&config.url);
        let max_connections = if memory { 1 } else { config.max_connections };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        if memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(PlatformError::from)
            .context("connect database")?;

        info!(max_connections, memory, "Database pool ready");
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    pub async fn connect_in_memory() -> Result<Self> {
        let store = Self::connect(&DatabaseConfig::default()).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.pool)
    }

    /// Apply the schema and seed the global scope. Safe to re-run.
    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.begin().await?;
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&mut *conn).await?;
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO iam_scope
                (public_id, parent_id, scope_type, name, description, create_time, update_time)
            VALUES (?, NULL, 'global', 'global', 'Global scope', ?, ?)
            "#,
        )
        .bind(GLOBAL_SCOPE_ID)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        conn.commit().await?;
        info!("Schema initialized");
        Ok(())
    }

    /// Run `f` inside a transaction.
    ///
    /// Returns the callback's value and the number of retries used. An `Err`
    /// from the callback rolls back; transient errors are retried up to
    /// `max_retries` times, sleeping per `backoff` in between. Cancellation
    /// of `ctx` before the transaction opens prevents any write, and during
    /// the callback drops the work and rolls back.
    pub async fn do_tx<T, F>(
        &self,
        ctx: &ExecutionContext,
        max_retries: u32,
        backoff: &dyn Backoff,
        mut f: F,
    ) -> Result<(T, u32)>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, Result<T>> + Send,
    {
        let mut retries = 0u32;
        loop {
            ctx.check_cancelled()?;

            match self.attempt(ctx, &mut f).await {
                Ok(value) => return Ok((value, retries)),
                Err(err) if err.is_transient() && retries < max_retries => {
                    let delay = backoff.delay(retries);
                    retries += 1;
                    warn!(
                        execution_id = %ctx.execution_id,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = err.message(),
                        "Transient conflict, retrying transaction"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return Err(PlatformError::canceled("canceled during retry backoff"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(retries, "Transaction retries exhausted: {}", err);
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt<T, F>(&self, ctx: &ExecutionContext, f: &mut F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, Result<T>> + Send,
    {
        let inner = self.pool.begin().await?;
        let tx_id = new_public_id("tx")?;
        let mut tx = Tx::new(inner, ctx, tx_id);

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PlatformError::canceled("canceled mid-transaction")),
            result = f(&mut tx) => result,
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(tx_id = %tx.tx_id(), "Rolling back transaction: {}", err);
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> ConstBackoff {
        ConstBackoff(Duration::from_millis(1))
    }

    async fn scope_count(store: &Store) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM iam_scope")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    async fn insert_org(tx: &mut Tx, id: &str) -> Result<u64> {
        tx.execute(
            "INSERT INTO iam_scope (public_id, parent_id, scope_type, create_time, update_time) VALUES (?, 'global', 'org', ?, ?)",
            vec![id.into(), Utc::now().into(), Utc::now().into()],
        )
        .await
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = Store::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(scope_count(&store).await, 1);
    }

    #[tokio::test]
    async fn test_commit_on_ok() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        let (rows, retries) = store
            .do_tx(&ctx, 3, &fast(), |tx| Box::pin(async move { insert_org(tx, "o_commit").await }))
            .await
            .unwrap();
        assert_eq!((rows, retries), (1, 0));
        assert_eq!(scope_count(&store).await, 2);
    }

    #[tokio::test]
    async fn test_rollback_on_err() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        let err = store
            .do_tx(&ctx, 3, &fast(), |tx| {
                Box::pin(async move {
                    insert_org(tx, "o_rollback").await?;
                    Err::<(), _>(PlatformError::internal("forced"))
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(scope_count(&store).await, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        let attempts = Arc::new(AtomicU32::new(0));

        let (_, retries) = store
            .do_tx(&ctx, 5, &fast(), |tx| {
                let attempts = Arc::clone(&attempts);
                Box::pin(async move {
                    insert_org(tx, "o_retry").await?;
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(PlatformError::transient("simulated busy"));
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Rolled-back attempts left nothing behind.
        assert_eq!(scope_count(&store).await, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_last_error() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        let attempts = Arc::new(AtomicU32::new(0));

        let err = store
            .do_tx(&ctx, 2, &fast(), |_tx| {
                let attempts = Arc::clone(&attempts);
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PlatformError::transient("still busy"))
                })
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_domain_errors_not_retried() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        let attempts = Arc::new(AtomicU32::new(0));

        let err = store
            .do_tx(&ctx, 5, &fast(), |_tx| {
                let attempts = Arc::clone(&attempts);
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PlatformError::version_conflict("stale"))
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::VersionConflict);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_open_writes_nothing() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        ctx.cancellation_token().cancel();

        let err = store
            .do_tx(&ctx, 3, &fast(), |tx| Box::pin(async move { insert_org(tx, "o_cancel").await }))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert_eq!(scope_count(&store).await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_mid_transaction_rolls_back() {
        let store = Store::connect_in_memory().await.unwrap();
        let ctx = ExecutionContext::system();
        let token = ctx.cancellation_token().clone();

        let err = store
            .do_tx(&ctx, 3, &fast(), |tx| {
                let token = token.clone();
                Box::pin(async move {
                    insert_org(tx, "o_mid").await?;
                    token.cancel();
                    // Parks until the executor observes the cancellation.
                    futures::future::pending::<()>().await;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert_eq!(scope_count(&store).await, 1);
    }
}
