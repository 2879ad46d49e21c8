//! Portcullis Bootstrap
//!
//! Applies the schema and seeds a fresh deployment:
//! - the default org scope
//! - a password auth method in that org, marked as its primary method
//! - optionally an admin account with a password, and its principal
//!
//! Every step looks for existing rows first, so re-running is safe.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORTCULLIS_CONFIG` | - | Path to the TOML config file |
//! | `PORTCULLIS_DATABASE_URL` | `sqlite::memory:` | Database URL |
//! | `PORTCULLIS_KMS_ROOT_KEY` | - | Base64 AES-256 root key, required with `--admin-user` |
//! | `PORTCULLIS_ADMIN_PASSWORD` | - | Password for `--admin-user` |
//! | `LOG_FORMAT` | `text` | `json` or `text` |
//! | `RUST_LOG` | `info` | Log level |

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use pc_config::{AppConfig, ConfigLoader};
use pc_iam::store::{Limit, SqlValue};
use pc_iam::{
    Account, AccountRepository, AuthMethod, AuthMethodRepository, Configuration,
    CreateAccountOptions, ExecutionContext, LoginOptions, PrincipalRepository, Scope,
    ScopeRepository, Store, GLOBAL_SCOPE_ID,
};
use pc_kms::{generate_key, AeadWrapper, Wrapper};

#[derive(Parser, Debug)]
#[command(name = "pc-bootstrap", about = "Initialise a Portcullis database")]
struct Args {
    /// Config file path
    #[arg(long, env = "PORTCULLIS_CONFIG")]
    config: Option<String>,

    /// Print a new base64 root key and exit
    #[arg(long)]
    generate_key: bool,

    /// Print an example config file and exit
    #[arg(long)]
    example_config: bool,

    /// Create a password account with this user name and vivify its principal
    #[arg(long)]
    admin_user: Option<String>,

    #[arg(long, env = "PORTCULLIS_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        println!("{}", generate_key());
        return Ok(());
    }
    if args.example_config {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    pc_common::init_logging("pc-bootstrap");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("Failed to load configuration")?;

    let admin = match &args.admin_user {
        Some(user_name) => {
            let password = args
                .admin_password
                .as_deref()
                .context("--admin-user requires PORTCULLIS_ADMIN_PASSWORD")?;
            Some((user_name.as_str(), password, build_wrapper(&config)?))
        }
        None => None,
    };

    let store = Store::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to apply schema")?;

    let ctx = ExecutionContext::system();
    let org = ensure_org(&store, &config, &ctx).await?;
    let method = ensure_auth_method(&store, &config, &ctx, &org).await?;

    if let Some((user_name, password, wrapper)) = admin {
        ensure_admin(&store, &config, &ctx, wrapper, &method, user_name, password).await?;
    }

    info!(org_id = %org.public_id, auth_method_id = %method.public_id, "Bootstrap complete");
    Ok(())
}

/// Credentials sealed under a throwaway key could never be verified again,
/// so the admin path requires a configured root key.
fn build_wrapper(config: &AppConfig) -> Result<Arc<dyn Wrapper>> {
    if config.kms.root_key.is_empty() {
        bail!("--admin-user requires a KMS root key (set PORTCULLIS_KMS_ROOT_KEY or kms.root_key)");
    }
    let wrapper = AeadWrapper::new(config.kms.key_id.clone(), &config.kms.root_key)
        .context("Invalid KMS root key")?;
    Ok(Arc::new(wrapper))
}

async fn ensure_org(store: &Store, config: &AppConfig, ctx: &ExecutionContext) -> Result<Scope> {
    let name = &config.bootstrap.org_name;
    let existing = store
        .reader()
        .search_where::<Scope>(
            "parent_id = ? AND name = ?",
            vec![GLOBAL_SCOPE_ID.into(), SqlValue::from(name.as_str())],
            Limit::Max(1),
        )
        .await?;
    if let Some(org) = existing.into_iter().next() {
        info!(org_id = %org.public_id, "Org already exists");
        return Ok(org);
    }

    let scopes = ScopeRepository::new(store.clone(), &config.repository);
    let org = scopes
        .create_scope(ctx, &Scope::org().with_name(name.as_str()).with_description("Default org"))
        .await?;
    info!(org_id = %org.public_id, name = %name, "Created org");
    Ok(org)
}

async fn ensure_auth_method(
    store: &Store,
    config: &AppConfig,
    ctx: &ExecutionContext,
    org: &Scope,
) -> Result<AuthMethod> {
    let name = &config.bootstrap.auth_method_name;
    let existing = store
        .reader()
        .search_where::<AuthMethod>(
            "scope_id = ? AND name = ?",
            vec![org.public_id.as_str().into(), name.as_str().into()],
            Limit::Max(1),
        )
        .await?;
    let scopes = ScopeRepository::new(store.clone(), &config.repository);
    if let Some(method) = existing.into_iter().next() {
        info!(auth_method_id = %method.public_id, "Auth method already exists");
        scopes
            .set_primary_auth_method(ctx, &org.public_id, &method.public_id)
            .await?;
        return Ok(method);
    }

    let methods = AuthMethodRepository::new(store.clone(), &config.repository);
    let method = methods
        .create_auth_method(
            ctx,
            &AuthMethod::new(&org.public_id)
                .with_name(name.as_str())
                .with_configuration(Configuration {
                    min_user_name_length: config.bootstrap.min_user_name_length,
                    min_password_length: config.bootstrap.min_password_length,
                    ..Configuration::default()
                }),
        )
        .await?;
    scopes
        .set_primary_auth_method(ctx, &org.public_id, &method.public_id)
        .await?;
    info!(auth_method_id = %method.public_id, name = %name, "Created primary password auth method");
    Ok(method)
}

async fn ensure_admin(
    store: &Store,
    config: &AppConfig,
    ctx: &ExecutionContext,
    wrapper: Arc<dyn Wrapper>,
    method: &AuthMethod,
    user_name: &str,
    password: &str,
) -> Result<()> {
    let accounts = AccountRepository::new(store.clone(), wrapper, &config.repository);
    let existing = store
        .reader()
        .search_where::<Account>(
            "auth_method_id = ? AND user_name = ?",
            vec![method.public_id.as_str().into(), user_name.into()],
            Limit::Max(1),
        )
        .await?;

    let account = match existing.into_iter().next() {
        Some(account) => {
            info!(account_id = %account.public_id, "Admin account already exists");
            account
        }
        None => {
            let account = accounts
                .create_account(
                    ctx,
                    &Account::new(&method.public_id, user_name).with_name("admin"),
                    CreateAccountOptions::with_password(password),
                )
                .await?;
            info!(account_id = %account.public_id, user_name, "Created admin account");
            account
        }
    };

    let principals = PrincipalRepository::new(store.clone(), &config.repository);
    let principal = principals
        .lookup_principal_with_login(
            ctx,
            &account.public_id,
            LoginOptions {
                name: Some("admin".to_string()),
                description: Some("Bootstrap administrator".to_string()),
            },
        )
        .await?;
    info!(principal_id = %principal.public_id, "Admin principal ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_wrapper_requires_root_key() {
        let mut config = AppConfig::default();
        config.kms.root_key.clear();
        assert!(build_wrapper(&config).is_err());

        config.kms.root_key = generate_key();
        let wrapper = build_wrapper(&config).unwrap();
        assert_eq!(wrapper.key_id(), config.kms.key_id);
    }
}
