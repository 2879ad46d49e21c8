//! Principal Repository
//!
//! Principal CRUD with version-conditioned updates, plus ownership of
//! password accounts. Every change to the owned-account set bumps the
//! principal's version in the same transaction as the account writes, so
//! a failed reconciliation leaves both sides untouched.

use std::collections::BTreeSet;

use tracing::debug;

use pc_config::RepositoryConfig;

use crate::oplog::{OpType, OplogMetadata};
use crate::password::{Account, ListOptions};
use crate::principal::entity::{parse_field_mask, LoginOptions, Principal};
use crate::scope::Scope;
use crate::shared::error::{ErrorKind, PlatformError, Result, ResultExt};
use crate::shared::public_id::{new_public_id, PRINCIPAL_PREFIX};
use crate::shared::ExecutionContext;
use crate::store::{in_clause, Limit, RetryPolicy, SqlValue, Store, Tx};

/// Which way a reconciliation moves the owned-account set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconcile {
    Add,
    Delete,
    Set,
}

impl Reconcile {
    fn operation(&self) -> &'static str {
        match self {
            Reconcile::Add => "add principal accounts",
            Reconcile::Delete => "delete principal accounts",
            Reconcile::Set => "set principal accounts",
        }
    }
}

pub struct PrincipalRepository {
    store: Store,
    retry: RetryPolicy,
    default_limit: i64,
}

impl PrincipalRepository {
    pub fn new(store: Store, config: &RepositoryConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from(config),
            default_limit: config.default_limit,
        }
    }

    pub async fn create_principal(
        &self,
        ctx: &ExecutionContext,
        principal: &Principal,
    ) -> Result<Principal> {
        if !principal.public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("public id not empty")
                .context("create principal"));
        }
        if principal.scope_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing scope id")
                .context("create principal"));
        }

        let mut working = principal.clone();
        working.public_id = new_public_id(PRINCIPAL_PREFIX)?;
        working.version = 1;

        let (created, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let principal = working.clone();
                Box::pin(async move {
                    insert_principal(tx, &principal).await?;
                    Ok(principal)
                })
            })
            .await
            .map_err(|e| name_conflict(e, &working))
            .context("create principal")?;

        debug!(principal_id = %created.public_id, scope_id = %created.scope_id, "Principal created");
        Ok(created)
    }

    /// The principal and the ids of the accounts it owns. Not found is
    /// `Ok(None)`.
    pub async fn lookup_principal(
        &self,
        _ctx: &ExecutionContext,
        public_id: &str,
    ) -> Result<Option<(Principal, Vec<String>)>> {
        if public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id")
                .context("lookup principal"));
        }
        let reader = self.store.reader();
        let Some(principal) = reader
            .lookup_by_public_id::<Principal>(public_id)
            .await
            .with_context(|| format!("lookup principal {}", public_id))?
        else {
            return Ok(None);
        };
        let accounts = reader
            .search_where::<Account>("principal_id = ?", vec![public_id.into()], Limit::Unbounded)
            .await
            .with_context(|| format!("lookup principal {}", public_id))?;
        Ok(Some((principal, sorted_ids(&accounts))))
    }

    /// Write the masked fields of `principal` if the stored version is
    /// still `version`.
    ///
    /// Returns the updated principal, its current account ids and the
    /// number of rows updated, all read in the update's transaction.
    pub async fn update_principal<S: AsRef<str>>(
        &self,
        ctx: &ExecutionContext,
        principal: &Principal,
        version: u32,
        field_mask: &[S],
    ) -> Result<(Principal, Vec<String>, u64)> {
        if principal.public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id")
                .context("update principal"));
        }
        if version == 0 {
            return Err(PlatformError::invalid_parameter("missing version")
                .context("update principal"));
        }
        let fields = parse_field_mask(field_mask).context("update principal")?;

        let working = principal.clone();
        let (updated, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let principal = working.clone();
                let fields = fields.clone();
                Box::pin(async move {
                    let metadata = OplogMetadata::new().with("scope-id", &principal.scope_id);
                    let rows = tx
                        .update(&principal, &fields, Some(version), Some(metadata))
                        .await?;
                    match rows {
                        1 => {}
                        0 => return Err(zero_rows(tx, &principal.public_id, version).await),
                        n => {
                            return Err(PlatformError::multiple_records(format!(
                                "principal {}: {} rows updated",
                                principal.public_id, n
                            )))
                        }
                    }

                    let current = require_principal(tx, &principal.public_id).await?;
                    let account_ids = owned_account_ids(tx, &principal.public_id).await?;
                    Ok((current, account_ids, rows))
                })
            })
            .await
            .map_err(|e| name_conflict(e, &working))
            .with_context(|| format!("update principal {}", working.public_id))?;

        debug!(
            principal_id = %updated.0.public_id,
            version = updated.0.version,
            fields = ?fields,
            "Principal updated"
        );
        Ok(updated)
    }

    /// Delete a principal, first releasing the accounts it owns.
    pub async fn delete_principal(&self, ctx: &ExecutionContext, public_id: &str) -> Result<u64> {
        if public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id")
                .context("delete principal"));
        }

        let id = public_id.to_string();
        let (rows, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let id = id.clone();
                Box::pin(async move {
                    let principal = require_principal(tx, &id).await?;
                    for account_id in owned_account_ids(tx, &id).await? {
                        release_account(tx, &principal, &account_id).await?;
                    }

                    let metadata = OplogMetadata::new().with("scope-id", &principal.scope_id);
                    let rows = tx.delete(&principal, Some(metadata)).await?;
                    if rows > 1 {
                        return Err(PlatformError::multiple_records(format!(
                            "principal {}: {} rows deleted",
                            id, rows
                        )));
                    }
                    Ok(rows)
                })
            })
            .await
            .with_context(|| format!("delete principal {}", public_id))?;

        debug!(principal_id = public_id, rows, "Principal deleted");
        Ok(rows)
    }

    /// Principals in any of `scope_ids`. At least one scope id is required.
    pub async fn list_principals<S: AsRef<str>>(
        &self,
        _ctx: &ExecutionContext,
        scope_ids: &[S],
        opts: ListOptions,
    ) -> Result<Vec<Principal>> {
        if scope_ids.is_empty() {
            return Err(PlatformError::invalid_parameter("missing scope ids")
                .context("list principals"));
        }
        let args: Vec<SqlValue> = scope_ids.iter().map(|s| SqlValue::from(s.as_ref())).collect();
        let limit = Limit::resolve(opts.limit, self.default_limit);
        self.store
            .reader()
            .search_where::<Principal>(&in_clause("scope_id", scope_ids.len()), args, limit)
            .await
            .context("list principals")
    }

    /// Ids of the accounts owned by a principal, sorted.
    pub async fn list_principal_accounts(
        &self,
        _ctx: &ExecutionContext,
        principal_id: &str,
    ) -> Result<Vec<String>> {
        if principal_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing principal id")
                .context("list principal accounts"));
        }
        let accounts = self
            .store
            .reader()
            .search_where::<Account>("principal_id = ?", vec![principal_id.into()], Limit::Unbounded)
            .await
            .with_context(|| format!("list accounts of principal {}", principal_id))?;
        Ok(sorted_ids(&accounts))
    }

    /// Associate accounts with the principal. Returns the ids that were
    /// newly associated; ids it already owns are skipped.
    pub async fn add_principal_accounts<S: AsRef<str>>(
        &self,
        ctx: &ExecutionContext,
        principal_id: &str,
        version: u32,
        account_ids: &[S],
    ) -> Result<Vec<String>> {
        self.reconcile(ctx, Reconcile::Add, principal_id, version, account_ids)
            .await
    }

    /// Release accounts from the principal. Returns the ids that were
    /// removed; ids it does not own are skipped.
    pub async fn delete_principal_accounts<S: AsRef<str>>(
        &self,
        ctx: &ExecutionContext,
        principal_id: &str,
        version: u32,
        account_ids: &[S],
    ) -> Result<Vec<String>> {
        self.reconcile(ctx, Reconcile::Delete, principal_id, version, account_ids)
            .await
    }

    /// Make the owned set exactly `account_ids`. Returns the final set.
    /// An empty diff writes nothing and leaves the version alone.
    pub async fn set_principal_accounts<S: AsRef<str>>(
        &self,
        ctx: &ExecutionContext,
        principal_id: &str,
        version: u32,
        account_ids: &[S],
    ) -> Result<Vec<String>> {
        self.reconcile(ctx, Reconcile::Set, principal_id, version, account_ids)
            .await
    }

    /// The principal owning `account_id`. An unowned account of the
    /// scope's primary auth method gets a new principal in that scope,
    /// associated in the same transaction. Any other unowned account is
    /// `RecordNotFound` and stays unowned.
    pub async fn lookup_principal_with_login(
        &self,
        ctx: &ExecutionContext,
        account_id: &str,
        opts: LoginOptions,
    ) -> Result<Principal> {
        if account_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing account id")
                .context("lookup principal with login"));
        }

        let id = account_id.to_string();
        let (principal, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let id = id.clone();
                let opts = opts.clone();
                Box::pin(async move {
                    let account = tx
                        .lookup_by_public_id::<Account>(&id)
                        .await?
                        .ok_or_else(|| PlatformError::record_not_found(format!("account {}", id)))?;
                    if let Some(owner) = account.principal_id.as_deref() {
                        return require_principal(tx, owner).await;
                    }
                    let scope = tx
                        .lookup_by_public_id::<Scope>(&account.scope_id)
                        .await?
                        .ok_or_else(|| {
                            PlatformError::record_not_found(format!("scope {}", account.scope_id))
                        })?;
                    if !scope.vivifies_for(&account.auth_method_id) {
                        return Err(PlatformError::record_not_found(format!(
                            "account {} has no principal and {} is not the primary auth method of {}",
                            account.public_id, account.auth_method_id, scope.public_id
                        )));
                    }

                    let mut principal = Principal::new(&account.scope_id);
                    principal.public_id = new_public_id(PRINCIPAL_PREFIX)?;
                    principal.name = opts.name;
                    principal.description = opts.description;
                    insert_principal(tx, &principal).await?;

                    bump_version(tx, &principal).await?;
                    claim_account(tx, &principal, &account.public_id).await?;
                    require_principal(tx, &principal.public_id).await
                })
            })
            .await
            .with_context(|| format!("lookup principal with login {}", account_id))?;

        debug!(principal_id = %principal.public_id, account_id, "Principal resolved for login");
        Ok(principal)
    }

    async fn reconcile<S: AsRef<str>>(
        &self,
        ctx: &ExecutionContext,
        mode: Reconcile,
        principal_id: &str,
        version: u32,
        account_ids: &[S],
    ) -> Result<Vec<String>> {
        let operation = mode.operation();
        if principal_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing principal id").context(operation));
        }
        if version == 0 {
            return Err(PlatformError::invalid_parameter("missing version").context(operation));
        }
        if mode != Reconcile::Set && account_ids.is_empty() {
            return Err(PlatformError::invalid_parameter("missing account ids").context(operation));
        }
        let requested: BTreeSet<String> = account_ids
            .iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        if requested.iter().any(String::is_empty) {
            return Err(PlatformError::invalid_parameter("empty account id").context(operation));
        }

        let id = principal_id.to_string();
        let (result, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let id = id.clone();
                let requested = requested.clone();
                Box::pin(async move {
                    let principal = require_principal(tx, &id).await?;
                    if principal.version != version {
                        return Err(PlatformError::version_conflict(format!(
                            "principal {} is at version {}, not {}",
                            id, principal.version, version
                        )));
                    }

                    let current: BTreeSet<String> =
                        owned_account_ids(tx, &id).await?.into_iter().collect();
                    let accounts = load_accounts(tx, &requested).await?;
                    if let Some(other) = accounts.iter().find(|a| {
                        a.principal_id.as_deref().is_some_and(|owner| owner != id)
                    }) {
                        return Err(PlatformError::account_already_associated(format!(
                            "account {} is owned by principal {}",
                            other.public_id,
                            other.principal_id.as_deref().unwrap_or_default()
                        )));
                    }

                    let (to_add, to_remove): (Vec<String>, Vec<String>) = match mode {
                        Reconcile::Add => (
                            requested.difference(&current).cloned().collect(),
                            Vec::new(),
                        ),
                        Reconcile::Delete => (
                            Vec::new(),
                            requested.intersection(&current).cloned().collect(),
                        ),
                        Reconcile::Set => (
                            requested.difference(&current).cloned().collect(),
                            current.difference(&requested).cloned().collect(),
                        ),
                    };
                    if to_add.is_empty() && to_remove.is_empty() {
                        let unchanged = match mode {
                            Reconcile::Set => current.into_iter().collect(),
                            _ => Vec::new(),
                        };
                        return Ok((unchanged, false));
                    }

                    bump_version(tx, &principal).await?;
                    for account_id in &to_add {
                        claim_account(tx, &principal, account_id).await?;
                    }
                    for account_id in &to_remove {
                        release_account(tx, &principal, account_id).await?;
                    }

                    let result = match mode {
                        Reconcile::Add => to_add,
                        Reconcile::Delete => to_remove,
                        Reconcile::Set => owned_account_ids(tx, &id).await?,
                    };
                    Ok((result, true))
                })
            })
            .await
            .with_context(|| format!("{} {}", operation, principal_id))?;

        let (ids, changed) = result;
        debug!(principal_id, changed, accounts = ids.len(), "{}", operation);
        Ok(ids)
    }
}

fn sorted_ids(accounts: &[Account]) -> Vec<String> {
    let mut ids: Vec<String> = accounts.iter().map(|a| a.public_id.clone()).collect();
    ids.sort();
    ids
}

fn name_conflict(err: PlatformError, principal: &Principal) -> PlatformError {
    if err.is(ErrorKind::NotUnique) {
        PlatformError::not_unique(format!(
            "in scope {}: name {} already exists",
            principal.scope_id,
            principal.name.as_deref().unwrap_or_default()
        ))
        .with_source(err)
    } else {
        err
    }
}

async fn require_principal(tx: &mut Tx, public_id: &str) -> Result<Principal> {
    tx.lookup_by_public_id::<Principal>(public_id)
        .await?
        .ok_or_else(|| PlatformError::record_not_found(format!("principal {}", public_id)))
}

async fn owned_account_ids(tx: &mut Tx, principal_id: &str) -> Result<Vec<String>> {
    let accounts = tx
        .search_where::<Account>("principal_id = ?", vec![principal_id.into()], Limit::Unbounded)
        .await?;
    Ok(sorted_ids(&accounts))
}

/// Every requested account must exist.
async fn load_accounts(tx: &mut Tx, ids: &BTreeSet<String>) -> Result<Vec<Account>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let args: Vec<SqlValue> = ids.iter().map(|id| SqlValue::from(id.as_str())).collect();
    let accounts = tx
        .search_where::<Account>(&in_clause("public_id", ids.len()), args, Limit::Unbounded)
        .await?;
    if accounts.len() != ids.len() {
        let found: BTreeSet<&str> = accounts.iter().map(|a| a.public_id.as_str()).collect();
        let missing: Vec<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| !found.contains(id))
            .collect();
        return Err(PlatformError::record_not_found(format!(
            "accounts {}",
            missing.join(", ")
        )));
    }
    Ok(accounts)
}

async fn insert_principal(tx: &mut Tx, principal: &Principal) -> Result<()> {
    let scope = tx
        .lookup_by_public_id::<Scope>(&principal.scope_id)
        .await?
        .ok_or_else(|| PlatformError::record_not_found(format!("scope {}", principal.scope_id)))
        .context("lookup scope")?;
    if !scope.can_hold_principals() {
        return Err(PlatformError::invalid_parameter(format!(
            "principals cannot be created in project scope {}",
            scope.public_id
        )));
    }
    let metadata = OplogMetadata::new().with("scope-id", &principal.scope_id);
    tx.create(principal, Some(metadata)).await
}

/// Version-conditioned bump recording a relationship change.
async fn bump_version(tx: &mut Tx, principal: &Principal) -> Result<()> {
    let rows = tx
        .execute(
            "UPDATE iam_principal SET version = version + 1, update_time = ? WHERE public_id = ? AND version = ?",
            vec![
                chrono::Utc::now().into(),
                principal.public_id.as_str().into(),
                principal.version.into(),
            ],
        )
        .await?;
    if rows != 1 {
        return Err(zero_rows(tx, &principal.public_id, principal.version).await);
    }
    let metadata = OplogMetadata::new().with("scope-id", &principal.scope_id);
    tx.write_oplog::<Principal>(&principal.public_id, OpType::Update, metadata)
        .await
}

/// Tell a missing row apart from a stale version after a conditioned
/// write matched nothing. Runs in the failed write's transaction.
async fn zero_rows(tx: &mut Tx, public_id: &str, version: u32) -> PlatformError {
    match tx.exists::<Principal>(public_id).await {
        Ok(true) => PlatformError::version_conflict(format!(
            "principal {} is not at version {}",
            public_id, version
        )),
        Ok(false) => PlatformError::record_not_found(format!("principal {}", public_id)),
        Err(e) => e,
    }
}

async fn claim_account(tx: &mut Tx, principal: &Principal, account_id: &str) -> Result<()> {
    let rows = tx
        .execute(
            "UPDATE auth_password_account SET principal_id = ?, update_time = ? WHERE public_id = ? AND principal_id IS NULL",
            vec![
                principal.public_id.as_str().into(),
                chrono::Utc::now().into(),
                account_id.into(),
            ],
        )
        .await?;
    if rows != 1 {
        return Err(PlatformError::account_already_associated(format!(
            "account {} is already associated",
            account_id
        )));
    }
    let metadata = OplogMetadata::new()
        .with("scope-id", &principal.scope_id)
        .with("principal-id", &principal.public_id);
    tx.write_oplog::<Account>(account_id, OpType::Update, metadata)
        .await
}

async fn release_account(tx: &mut Tx, principal: &Principal, account_id: &str) -> Result<()> {
    let rows = tx
        .execute(
            "UPDATE auth_password_account SET principal_id = NULL, update_time = ? WHERE public_id = ? AND principal_id = ?",
            vec![
                chrono::Utc::now().into(),
                account_id.into(),
                principal.public_id.as_str().into(),
            ],
        )
        .await?;
    if rows != 1 {
        return Err(PlatformError::version_conflict(format!(
            "account {} is no longer owned by principal {}",
            account_id, principal.public_id
        )));
    }
    let metadata = OplogMetadata::new()
        .with("scope-id", &principal.scope_id)
        .with("principal-id", &principal.public_id);
    tx.write_oplog::<Account>(account_id, OpType::Update, metadata)
        .await
}
