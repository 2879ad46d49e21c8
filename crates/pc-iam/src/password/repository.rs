//! Password Account Repository
//!
//! Accounts are created against the auth method's current configuration,
//! read inside the same transaction as the insert. A credential supplied
//! at creation is derived, sealed and written in that transaction too.

use std::sync::Arc;

use tracing::{debug, warn};

use pc_config::RepositoryConfig;
use pc_kms::Wrapper;

use crate::oplog::OplogMetadata;
use crate::password::account::{validate_user_name, Account, CreateAccountOptions, ListOptions};
use crate::password::auth_method::AuthMethod;
use crate::password::credential::Credential;
use crate::shared::error::{ErrorKind, PlatformError, Result, ResultExt};
use crate::shared::public_id::{new_public_id, PASSWORD_ACCOUNT_PREFIX};
use crate::shared::ExecutionContext;
use crate::store::{Limit, RetryPolicy, Store};

pub struct AccountRepository {
    store: Store,
    wrapper: Arc<dyn Wrapper>,
    retry: RetryPolicy,
    default_limit: i64,
}

impl AccountRepository {
    pub fn new(store: Store, wrapper: Arc<dyn Wrapper>, config: &RepositoryConfig) -> Self {
        Self {
            store,
            wrapper,
            retry: RetryPolicy::from(config),
            default_limit: config.default_limit,
        }
    }

    /// Insert a new account, optionally with a password credential.
    pub async fn create_account(
        &self,
        ctx: &ExecutionContext,
        account: &Account,
        opts: CreateAccountOptions,
    ) -> Result<Account> {
        if !account.public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("public id not empty")
                .context("create account"));
        }
        if account.auth_method_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing auth method id")
                .context("create account"));
        }
        validate_user_name(&account.user_name).context("create account")?;

        let mut working = account.clone();
        working.public_id = new_public_id(PASSWORD_ACCOUNT_PREFIX)?;
        working.principal_id = None;

        let wrapper = Arc::clone(&self.wrapper);
        let (created, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let mut account = working.clone();
                let password = opts.password.clone();
                let wrapper = Arc::clone(&wrapper);
                Box::pin(async move {
                    let method = tx
                        .lookup_by_public_id::<AuthMethod>(&account.auth_method_id)
                        .await?
                        .ok_or_else(|| {
                            PlatformError::record_not_found(format!(
                                "auth method {}",
                                account.auth_method_id
                            ))
                        })?;
                    let config = method.configuration();

                    let length = account.user_name.chars().count();
                    if length < config.min_user_name_length as usize {
                        return Err(PlatformError::too_short(format!(
                            "user name {} must be at least {} characters",
                            account.user_name, config.min_user_name_length
                        )));
                    }
                    account.scope_id = method.scope_id.clone();

                    let credential = match password {
                        Some(password) => Some(
                            Credential::derive(
                                &wrapper,
                                &account.public_id,
                                &method.public_id,
                                &password,
                                &config,
                            )
                            .await?,
                        ),
                        None => None,
                    };

                    let metadata = OplogMetadata::new()
                        .with("scope-id", &account.scope_id)
                        .with("auth-method-id", &account.auth_method_id);
                    tx.create(&account, Some(metadata.clone())).await?;
                    if let Some(credential) = credential {
                        tx.create(&credential, Some(metadata)).await?;
                    }
                    Ok(account)
                })
            })
            .await
            .map_err(|e| {
                if e.is(ErrorKind::NotUnique) {
                    PlatformError::not_unique(format!(
                        "in auth method {}: name {} or user name {} already exists",
                        working.auth_method_id,
                        working.name.as_deref().unwrap_or_default(),
                        working.user_name
                    ))
                    .with_source(e)
                } else {
                    e
                }
            })
            .with_context(|| format!("create account for auth method {}", working.auth_method_id))?;

        debug!(
            account_id = %created.public_id,
            auth_method_id = %created.auth_method_id,
            with_password = opts.password.is_some(),
            "Account created"
        );
        Ok(created)
    }

    /// Not found is `Ok(None)`.
    pub async fn lookup_account(
        &self,
        _ctx: &ExecutionContext,
        public_id: &str,
    ) -> Result<Option<Account>> {
        if public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id")
                .context("lookup account"));
        }
        self.store
            .reader()
            .lookup_by_public_id::<Account>(public_id)
            .await
            .with_context(|| format!("lookup account {}", public_id))
    }

    /// Accounts of one auth method, in storage order.
    pub async fn list_accounts(
        &self,
        _ctx: &ExecutionContext,
        auth_method_id: &str,
        opts: ListOptions,
    ) -> Result<Vec<Account>> {
        if auth_method_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing auth method id")
                .context("list accounts"));
        }
        let limit = Limit::resolve(opts.limit, self.default_limit);
        self.store
            .reader()
            .search_where::<Account>("auth_method_id = ?", vec![auth_method_id.into()], limit)
            .await
            .with_context(|| format!("list accounts for auth method {}", auth_method_id))
    }

    /// Delete an account and its credential. A missing id deletes 0 rows.
    pub async fn delete_account(&self, ctx: &ExecutionContext, public_id: &str) -> Result<u64> {
        if public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id")
                .context("delete account"));
        }

        let id = public_id.to_string();
        let (rows, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let id = id.clone();
                Box::pin(async move {
                    let Some(account) = tx.lookup_by_public_id::<Account>(&id).await? else {
                        return Ok(0);
                    };
                    let metadata = OplogMetadata::new()
                        .with("scope-id", &account.scope_id)
                        .with("auth-method-id", &account.auth_method_id);

                    if let Some(credential) = tx.lookup_by_public_id::<Credential>(&id).await? {
                        tx.delete(&credential, Some(metadata.clone())).await?;
                    }

                    let rows = tx.delete(&account, Some(metadata)).await?;
                    if rows > 1 {
                        return Err(PlatformError::multiple_records(format!(
                            "account {}: {} rows deleted",
                            id, rows
                        )));
                    }
                    Ok(rows)
                })
            })
            .await
            .with_context(|| format!("delete account {}", public_id))?;

        debug!(account_id = public_id, rows, "Account deleted");
        Ok(rows)
    }

    /// A missing account or credential is `false`, as is a wrong password.
    pub async fn verify_password(
        &self,
        _ctx: &ExecutionContext,
        account_id: &str,
        candidate: &str,
    ) -> Result<bool> {
        if account_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing account id")
                .context("verify password"));
        }
        let credential = self
            .store
            .reader()
            .lookup_by_public_id::<Credential>(account_id)
            .await
            .with_context(|| format!("verify password for account {}", account_id))?;

        let Some(credential) = credential else {
            debug!(account_id, "No credential for account");
            return Ok(false);
        };
        let ok = credential
            .verify(&self.wrapper, candidate)
            .await
            .with_context(|| format!("verify password for account {}", account_id))?;
        if !ok {
            warn!(account_id, "Password verification failed");
        }
        Ok(ok)
    }

    /// Resolve a login to its account. Unknown user names and wrong
    /// passwords are both `Ok(None)`.
    pub async fn authenticate(
        &self,
        ctx: &ExecutionContext,
        auth_method_id: &str,
        user_name: &str,
        password: &str,
    ) -> Result<Option<Account>> {
        if auth_method_id.is_empty() || user_name.is_empty() {
            return Err(PlatformError::invalid_parameter("missing auth method id or user name")
                .context("authenticate"));
        }
        let mut found = self
            .store
            .reader()
            .search_where::<Account>(
                "auth_method_id = ? AND user_name = ?",
                vec![auth_method_id.into(), user_name.into()],
                Limit::Max(1),
            )
            .await
            .context("authenticate")?;

        let Some(account) = found.pop() else {
            debug!(auth_method_id, user_name, "Unknown user name");
            return Ok(None);
        };
        if self.verify_password(ctx, &account.public_id, password).await? {
            Ok(Some(account))
        } else {
            Ok(None)
        }
    }
}
