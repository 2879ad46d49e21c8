//! Password Auth Method Repository

use tracing::debug;

use pc_config::RepositoryConfig;

use crate::oplog::OplogMetadata;
use crate::password::auth_method::{AuthMethod, Configuration, CONFIGURATION_FIELDS};
use crate::scope::Scope;
use crate::shared::error::{ErrorKind, PlatformError, Result, ResultExt};
use crate::shared::public_id::{new_public_id, PASSWORD_AUTH_METHOD_PREFIX};
use crate::shared::ExecutionContext;
use crate::store::{RetryPolicy, Store};

pub struct AuthMethodRepository {
    store: Store,
    retry: RetryPolicy,
}

impl AuthMethodRepository {
    pub fn new(store: Store, config: &RepositoryConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from(config),
        }
    }

    pub async fn create_auth_method(
        &self,
        ctx: &ExecutionContext,
        method: &AuthMethod,
    ) -> Result<AuthMethod> {
        if !method.public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("public id not empty")
                .context("create auth method"));
        }
        if method.scope_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing scope id")
                .context("create auth method"));
        }
        method.configuration().validate().context("create auth method")?;

        let mut working = method.clone();
        working.public_id = new_public_id(PASSWORD_AUTH_METHOD_PREFIX)?;
        working.version = 1;

        let (created, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let method = working.clone();
                Box::pin(async move {
                    let scope = tx
                        .lookup_by_public_id::<Scope>(&method.scope_id)
                        .await?
                        .ok_or_else(|| {
                            PlatformError::record_not_found(format!("scope {}", method.scope_id))
                        })?;
                    if !scope.can_hold_principals() {
                        return Err(PlatformError::invalid_parameter(format!(
                            "auth methods cannot be created in project scope {}",
                            scope.public_id
                        )));
                    }

                    let metadata = OplogMetadata::new().with("scope-id", &method.scope_id);
                    tx.create(&method, Some(metadata)).await?;
                    Ok(method)
                })
            })
            .await
            .map_err(|e| {
                if e.is(ErrorKind::NotUnique) {
                    PlatformError::not_unique(format!(
                        "in scope {}: auth method name {} already exists",
                        working.scope_id,
                        working.name.as_deref().unwrap_or_default()
                    ))
                    .with_source(e)
                } else {
                    e
                }
            })
            .context("create auth method")?;

        debug!(auth_method_id = %created.public_id, scope_id = %created.scope_id, "Auth method created");
        Ok(created)
    }

    pub async fn lookup_auth_method(
        &self,
        _ctx: &ExecutionContext,
        public_id: &str,
    ) -> Result<Option<AuthMethod>> {
        if public_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing public id")
                .context("lookup auth method"));
        }
        self.store
            .reader()
            .lookup_by_public_id::<AuthMethod>(public_id)
            .await
            .with_context(|| format!("lookup auth method {}", public_id))
    }

    /// Current configuration. Operations that must be consistent with a
    /// write read it inside their own transaction instead.
    pub async fn get_configuration(
        &self,
        ctx: &ExecutionContext,
        auth_method_id: &str,
    ) -> Result<Configuration> {
        self.lookup_auth_method(ctx, auth_method_id)
            .await?
            .map(|m| m.configuration())
            .ok_or_else(|| {
                PlatformError::record_not_found(format!("auth method {}", auth_method_id))
                    .context("get configuration")
            })
    }

    /// Replace the configuration, conditioned on `version`.
    pub async fn set_configuration(
        &self,
        ctx: &ExecutionContext,
        auth_method_id: &str,
        version: u32,
        config: Configuration,
    ) -> Result<AuthMethod> {
        if auth_method_id.is_empty() {
            return Err(PlatformError::invalid_parameter("missing auth method id")
                .context("set configuration"));
        }
        if version == 0 {
            return Err(PlatformError::invalid_parameter("missing version")
                .context("set configuration"));
        }
        config.validate().context("set configuration")?;

        let id = auth_method_id.to_string();
        let (updated, _) = self
            .store
            .do_tx(ctx, self.retry.max_retries, &self.retry.backoff, |tx| {
                let id = id.clone();
                Box::pin(async move {
                    let mut method = tx
                        .lookup_by_public_id::<AuthMethod>(&id)
                        .await?
                        .ok_or_else(|| PlatformError::record_not_found(format!("auth method {}", id)))?;
                    method.apply(config);

                    let metadata = OplogMetadata::new().with("scope-id", &method.scope_id);
                    let rows = tx
                        .update(&method, CONFIGURATION_FIELDS, Some(version), Some(metadata))
                        .await?;
                    match rows {
                        1 => {}
                        0 => {
                            return Err(PlatformError::version_conflict(format!(
                                "auth method {} is not at version {}",
                                id, version
                            )))
                        }
                        n => {
                            return Err(PlatformError::multiple_records(format!(
                                "auth method {}: {} rows updated",
                                id, n
                            )))
                        }
                    }

                    tx.lookup_by_public_id::<AuthMethod>(&id)
                        .await?
                        .ok_or_else(|| PlatformError::record_not_found(format!("auth method {}", id)))
                })
            })
            .await
            .context("set configuration")?;

        debug!(auth_method_id, version = updated.version, "Auth method configuration updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GLOBAL_SCOPE_ID;

    async fn repo() -> AuthMethodRepository {
        let store = Store::connect_in_memory().await.unwrap();
        AuthMethodRepository::new(store, &RepositoryConfig::default())
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let repo = repo().await;
        let ctx = ExecutionContext::system();

        let created = repo
            .create_auth_method(&ctx, &AuthMethod::new(GLOBAL_SCOPE_ID).with_name("password"))
            .await
            .unwrap();
        assert!(created.public_id.starts_with("ampw_"));

        let found = repo.lookup_auth_method(&ctx, &created.public_id).await.unwrap().unwrap();
        assert_eq!(found.configuration(), Configuration::default());
        assert!(repo.lookup_auth_method(&ctx, "ampw_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_scope() {
        let repo = repo().await;
        let err = repo
            .create_auth_method(&ExecutionContext::system(), &AuthMethod::new("o_nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecordNotFound);
    }

    #[tokio::test]
    async fn test_set_configuration_bumps_version() {
        let repo = repo().await;
        let ctx = ExecutionContext::system();
        let method = repo
            .create_auth_method(&ctx, &AuthMethod::new(GLOBAL_SCOPE_ID))
            .await
            .unwrap();

        let config = Configuration {
            min_user_name_length: 10,
            ..method.configuration()
        };
        let updated = repo
            .set_configuration(&ctx, &method.public_id, 1, config)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(
            repo.get_configuration(&ctx, &method.public_id).await.unwrap().min_user_name_length,
            10
        );

        let err = repo
            .set_configuration(&ctx, &method.public_id, 1, config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionConflict);
    }

    #[tokio::test]
    async fn test_set_configuration_missing_method() {
        let repo = repo().await;
        let err = repo
            .set_configuration(&ExecutionContext::system(), "ampw_missing", 1, Configuration::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecordNotFound);
    }
}
