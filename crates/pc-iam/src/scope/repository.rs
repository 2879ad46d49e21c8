//! Scope Repository
//!
//! Just enough scope management for scopes to act as the uniqueness
//! boundary and existence check for principals and auth methods.

use tracing::debug;

use pc_config::RepositoryConfig;

use crate::oplog::OplogMetadata;
use crate::password::AuthMethod;
use crate::scope::{Scope, ScopeType};
use crate::shared::error::{ErrorKind, PlatformError, Result, ResultExt};
use crate::shared::public_id::{new_public_id, ORG_PREFIX, PROJECT_PREFIX};
use crate::shared::ExecutionContext;
use crate::store::{RetryPolicy, Store, GLOBAL_SCOPE_ID};

pub struct ScopeRepository {
    store: Store,
    retry: RetryPolicy,
}

impl ScopeRepository {
    pub fn new(store: Store, config: &RepositoryConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from(config),
        }
    }

    /// Insert an org or project. `scope.public_id` must be empty.
    pub async fn create_scope(&self, ctx: &ExecutionContext, scope: &Scope) -> Result<Scope> {
        if !scope.public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("public id not empty").context("create scope"));
        }

        let mut working = scope.clone();
        working.public_id = match scope.scope_type {
            ScopeType::Global => {
                return Err(PlatformError::invalid_parameter("the global scope already exists")
                    .context("create scope"));
            }
            ScopeType::Org => {
                working.parent_id = Some(GLOBAL_SCOPE_ID.to_string());
                new_public_id(ORG_PREFIX)?
            }
            ScopeType::Project => {
                if scope.parent_id.as_deref().unwrap_or_default().is_empty() {
                    return Err(PlatformError::invalid_parameter("project requires a parent org")
                        .context("create scope"));
                }
                new_public_id(PROJECT_PREFIX)?
            }
        };

        let (created, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let scope = working.clone();
                Box::pin(async move {
                    let parent_id = scope.parent_id.clone().unwrap_or_default();
                    let parent = tx
                        .lookup_by_public_id::<Scope>(&parent_id)
                        .await?
                        .ok_or_else(|| {
                            PlatformError::record_not_found(format!("parent scope {}", parent_id))
                        })?;
                    let expected_parent = match scope.scope_type {
                        ScopeType::Project => ScopeType::Org,
                        _ => ScopeType::Global,
                    };
                    if parent.scope_type != expected_parent {
                        return Err(PlatformError::invalid_parameter(format!(
                            "{} scope cannot be created under {} scope {}",
                            scope.scope_type.as_str(),
                            parent.scope_type.as_str(),
                            parent.public_id
                        )));
                    }

                    let metadata = OplogMetadata::new().with("scope-id", &parent.public_id);
                    tx.create(&scope, Some(metadata)).await?;
                    Ok(scope)
                })
            })
            .await
            .map_err(|e| {
                if e.is(ErrorKind::NotUnique) {
                    PlatformError::not_unique(format!(
                        "scope {} already exists under {}",
                        working.name.as_deref().unwrap_or_default(),
                        working.parent_id.as_deref().unwrap_or_default()
                    ))
                    .with_source(e)
                } else {
                    e
                }
            })
            .context("create scope")?;

        debug!(scope_id = %created.public_id, scope_type = created.scope_type.as_str(), "Scope created");
        Ok(created)
    }

    /// Mark `auth_method_id` as the scope's primary auth method. Logins
    /// through an unowned account of that method create a principal.
    pub async fn set_primary_auth_method(
        &self,
        ctx: &ExecutionContext,
        scope_id: &str,
        auth_method_id: &str,
    ) -> Result<Scope> {
        if scope_id.is_empty() || auth_method_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing scope id or auth method id")
                .context("set primary auth method"));
        }

        let scope_id = scope_id.to_string();
        let auth_method_id = auth_method_id.to_string();
        let (scope, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let scope_id = scope_id.clone();
                let auth_method_id = auth_method_id.clone();
                Box::pin(async move {
                    let mut scope = tx
                        .lookup_by_public_id::<Scope>(&scope_id)
                        .await?
                        .ok_or_else(|| PlatformError::record_not_found(format!("scope {}", scope_id)))?;
                    let method = tx
                        .lookup_by_public_id::<AuthMethod>(&auth_method_id)
                        .await?
                        .ok_or_else(|| {
                            PlatformError::record_not_found(format!("auth method {}", auth_method_id))
                        })?;
                    if method.scope_id != scope.public_id {
                        return Err(PlatformError::invalid_parameter(format!(
                            "auth method {} belongs to scope {}, not {}",
                            method.public_id, method.scope_id, scope.public_id
                        )));
                    }
                    if scope.vivifies_for(&method.public_id) {
                        return Ok(scope);
                    }

                    scope.primary_auth_method_id = Some(method.public_id.clone());
                    let metadata = OplogMetadata::new().with("auth-method-id", &method.public_id);
                    tx.update(&scope, &["PrimaryAuthMethodId"], None, Some(metadata))
                        .await?;
                    tx.lookup_by_public_id::<Scope>(&scope.public_id)
                        .await?
                        .ok_or_else(|| PlatformError::record_not_found(format!("scope {}", scope_id)))
                })
            })
            .await
            .with_context(|| format!("set primary auth method of {}", scope_id))?;

        debug!(scope_id = %scope.public_id, auth_method_id = %auth_method_id, "Primary auth method set");
        Ok(scope)
    }

    /// Not found is `Ok(None)`.
    pub async fn lookup_scope(&self, _ctx: &ExecutionContext, public_id: &str) -> Result<Option<Scope>> {
        if public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id").context("lookup scope"));
        }
        self.store
            .reader()
            .lookup_by_public_id::<Scope>(public_id)
            .await
            .with_context(|| format!("lookup scope {}", public_id))
    }
}
