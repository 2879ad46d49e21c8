//! Repository Integration Tests
//!
//! Drives the public repository API against an in-memory SQLite store:
//! account creation against live configuration, credential round trips,
//! optimistic concurrency on principals, ownership reconciliation and
//! oplog atomicity.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pc_config::{DatabaseConfig, RepositoryConfig};
use pc_iam::{
    Account, AccountRepository, Argon2Params, AuthMethod, AuthMethodRepository, Configuration,
    CreateAccountOptions, ErrorKind, ExecutionContext, LoginOptions, OpType, OplogRepository,
    Principal, PrincipalRepository, ScopeRepository, Store, GLOBAL_SCOPE_ID,
};
use pc_iam::store::Resource;
use pc_kms::{generate_key, AeadWrapper, KmsError, Wrapper};

struct Harness {
    scopes: ScopeRepository,
    accounts: AccountRepository,
    principals: PrincipalRepository,
    methods: AuthMethodRepository,
    oplog: OplogRepository,
    method: AuthMethod,
}

async fn harness_with(wrapper: Arc<dyn Wrapper>) -> Harness {
    pc_common::init_test_logging();

    let store = Store::connect_in_memory().await.unwrap();
    let config = RepositoryConfig::default();
    let methods = AuthMethodRepository::new(store.clone(), &config);
    let method = methods
        .create_auth_method(
            &ExecutionContext::system(),
            &AuthMethod::new(GLOBAL_SCOPE_ID)
                .with_name("password")
                .with_configuration(Configuration {
                    min_user_name_length: 5,
                    min_password_length: 8,
                    argon2: Argon2Params::testing(),
                }),
        )
        .await
        .unwrap();
    let scopes = ScopeRepository::new(store.clone(), &config);
    scopes
        .set_primary_auth_method(&ExecutionContext::system(), GLOBAL_SCOPE_ID, &method.public_id)
        .await
        .unwrap();

    Harness {
        scopes,
        accounts: AccountRepository::new(store.clone(), wrapper, &config),
        principals: PrincipalRepository::new(store.clone(), &config),
        methods,
        oplog: OplogRepository::new(store),
        method,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(AeadWrapper::new("root", &generate_key()).unwrap())).await
}

impl Harness {
    async fn account(&self, user_name: &str) -> Account {
        self.accounts
            .create_account(
                &ExecutionContext::system(),
                &Account::new(&self.method.public_id, user_name),
                CreateAccountOptions::default(),
            )
            .await
            .unwrap()
    }

    async fn principal(&self) -> Principal {
        self.principals
            .create_principal(&ExecutionContext::system(), &Principal::new(GLOBAL_SCOPE_ID))
            .await
            .unwrap()
    }

    async fn version(&self, principal_id: &str) -> u32 {
        let (p, _) = self
            .principals
            .lookup_principal(&ExecutionContext::system(), principal_id)
            .await
            .unwrap()
            .unwrap();
        p.version
    }
}

/// Wrapper whose encrypt always fails.
struct FailingWrapper;

#[async_trait]
impl Wrapper for FailingWrapper {
    fn key_id(&self) -> &str {
        "broken"
    }

    async fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        Err(KmsError::EncryptionError("kms unavailable".into()))
    }

    async fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        Err(KmsError::DecryptionError("kms unavailable".into()))
    }
}

/// Wrapper that cancels a token during encrypt and never returns.
struct CancellingWrapper {
    token: CancellationToken,
    calls: AtomicU32,
}

#[async_trait]
impl Wrapper for CancellingWrapper {
    fn key_id(&self) -> &str {
        "stalled"
    }

    async fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        futures::future::pending().await
    }

    async fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_user_name_length_from_auth_method() {
    let h = harness().await;
    let ctx = ExecutionContext::system();

    let alice = h
        .accounts
        .create_account(&ctx, &Account::new(&h.method.public_id, "alice.smith"), Default::default())
        .await
        .unwrap();
    assert!(alice.public_id.starts_with("acctpw_"));

    let err = h
        .accounts
        .create_account(&ctx, &Account::new(&h.method.public_id, "al"), Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooShort);
}

#[tokio::test]
async fn test_lowered_minimum_applies_to_next_create() {
    let h = harness().await;
    let ctx = ExecutionContext::system();

    let relaxed = Configuration {
        min_user_name_length: 2,
        ..h.method.configuration()
    };
    h.methods
        .set_configuration(&ctx, &h.method.public_id, h.method.version, relaxed)
        .await
        .unwrap();

    assert!(h
        .accounts
        .create_account(&ctx, &Account::new(&h.method.public_id, "al"), Default::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_credential_round_trip() {
    let h = harness().await;
    let ctx = ExecutionContext::system();

    let account = h
        .accounts
        .create_account(
            &ctx,
            &Account::new(&h.method.public_id, "bob.jones"),
            CreateAccountOptions::with_password("p@ssw0rd-long"),
        )
        .await
        .unwrap();

    assert!(h
        .accounts
        .verify_password(&ctx, &account.public_id, "p@ssw0rd-long")
        .await
        .unwrap());
    for wrong in ["p@ssw0rd-lonG", "", "p@ssw0rd-long "] {
        assert!(!h.accounts.verify_password(&ctx, &account.public_id, wrong).await.unwrap());
    }

    let creates = h
        .oplog
        .count_for_entity(&account.public_id, pc_iam::Credential::RESOURCE_TYPE, OpType::Create)
        .await
        .unwrap();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_encryption_failure_writes_nothing() {
    let h = harness_with(Arc::new(FailingWrapper)).await;
    let ctx = ExecutionContext::system();
    let before = h.oplog.count().await.unwrap();

    let err = h
        .accounts
        .create_account(
            &ctx,
            &Account::new(&h.method.public_id, "carol.white"),
            CreateAccountOptions::with_password("long-enough"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Encryption);

    let listed = h
        .accounts
        .list_accounts(&ctx, &h.method.public_id, Default::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
    assert_eq!(h.oplog.count().await.unwrap(), before);
}

#[tokio::test]
async fn test_cancel_mid_transaction_rolls_back() {
    let token = CancellationToken::new();
    let wrapper = Arc::new(CancellingWrapper {
        token: token.clone(),
        calls: AtomicU32::new(0),
    });
    let h = harness_with(wrapper.clone()).await;
    let ctx = ExecutionContext::system().with_cancellation(token);
    let before = h.oplog.count().await.unwrap();

    let err = h
        .accounts
        .create_account(
            &ctx,
            &Account::new(&h.method.public_id, "dave.brown"),
            CreateAccountOptions::with_password("long-enough"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(wrapper.calls.load(Ordering::SeqCst), 1);

    let sys = ExecutionContext::system();
    let listed = h
        .accounts
        .list_accounts(&sys, &h.method.public_id, Default::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
    assert_eq!(h.oplog.count().await.unwrap(), before);
}

#[tokio::test]
async fn test_cancel_before_open_writes_nothing() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    ctx.cancellation_token().cancel();

    let err = h
        .principals
        .create_principal(&ctx, &Principal::new(GLOBAL_SCOPE_ID).with_name("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);

    let listed = h
        .principals
        .list_principals(&ExecutionContext::system(), &[GLOBAL_SCOPE_ID], Default::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_empty_field_mask_touches_nothing() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;

    let none: [&str; 0] = [];
    let err = h.principals.update_principal(&ctx, &p, 1, &none).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyFieldMask);

    assert_eq!(h.version(&p.public_id).await, 1);
    let updates = h
        .oplog
        .count_for_entity(&p.public_id, Principal::RESOURCE_TYPE, OpType::Update)
        .await
        .unwrap();
    assert_eq!(updates, 0);
}

#[tokio::test]
async fn test_concurrent_updates_one_wins() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;

    let mut first = p.clone();
    first.name = Some("first".into());
    let mut second = p.clone();
    second.name = Some("second".into());

    let (a, b) = tokio::join!(
        h.principals.update_principal(&ctx, &first, 1, &["Name"]),
        h.principals.update_principal(&ctx, &second, 1, &["Name"]),
    );

    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = a.err().or(b.err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::VersionConflict);
    assert_eq!(h.version(&p.public_id).await, 2);
}

#[tokio::test]
async fn test_update_returns_associated_accounts() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;
    let acct = h.account("erin.green").await;

    h.principals
        .add_principal_accounts(&ctx, &p.public_id, 1, &[acct.public_id.as_str()])
        .await
        .unwrap();

    let mut renamed = p.clone();
    renamed.name = Some("erin".into());
    let (updated, accounts, rows) = h
        .principals
        .update_principal(&ctx, &renamed, 2, &["name"])
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(updated.version, 3);
    assert_eq!(accounts, vec![acct.public_id]);
}

#[tokio::test]
async fn test_account_owned_by_other_principal() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let owner = h.principal().await;
    let other = h.principal().await;
    let shared = h.account("shared.acct").await;
    let free = h.account("free.acct").await;

    h.principals
        .add_principal_accounts(&ctx, &owner.public_id, 1, &[shared.public_id.as_str()])
        .await
        .unwrap();
    let oplog_before = h.oplog.count().await.unwrap();

    let err = h
        .principals
        .add_principal_accounts(
            &ctx,
            &other.public_id,
            1,
            &[free.public_id.as_str(), shared.public_id.as_str()],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccountAlreadyAssociated);

    // All or nothing: the free account was not taken either.
    assert_eq!(h.version(&other.public_id).await, 1);
    assert_eq!(h.version(&owner.public_id).await, 2);
    let owned = h
        .principals
        .list_principal_accounts(&ctx, &other.public_id)
        .await
        .unwrap();
    assert!(owned.is_empty());
    assert_eq!(h.oplog.count().await.unwrap(), oplog_before);

    let err = h
        .principals
        .delete_principal_accounts(&ctx, &other.public_id, 1, &[shared.public_id.as_str()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccountAlreadyAssociated);
}

#[tokio::test]
async fn test_add_and_delete_are_idempotent_per_id() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;
    let a = h.account("acct.one").await;
    let b = h.account("acct.two").await;

    let added = h
        .principals
        .add_principal_accounts(&ctx, &p.public_id, 1, &[a.public_id.as_str()])
        .await
        .unwrap();
    assert_eq!(added, vec![a.public_id.clone()]);

    // Re-adding an owned id is a no-op for that id.
    let added = h
        .principals
        .add_principal_accounts(&ctx, &p.public_id, 2, &[a.public_id.as_str(), b.public_id.as_str()])
        .await
        .unwrap();
    assert_eq!(added, vec![b.public_id.clone()]);
    assert_eq!(h.version(&p.public_id).await, 3);

    let none_added = h
        .principals
        .add_principal_accounts(&ctx, &p.public_id, 3, &[a.public_id.as_str()])
        .await
        .unwrap();
    assert!(none_added.is_empty());
    assert_eq!(h.version(&p.public_id).await, 3);

    let removed = h
        .principals
        .delete_principal_accounts(&ctx, &p.public_id, 3, &[a.public_id.as_str()])
        .await
        .unwrap();
    assert_eq!(removed, vec![a.public_id.clone()]);
    assert_eq!(h.version(&p.public_id).await, 4);

    let none_removed = h
        .principals
        .delete_principal_accounts(&ctx, &p.public_id, 4, &[a.public_id.as_str()])
        .await
        .unwrap();
    assert!(none_removed.is_empty());
    assert_eq!(h.version(&p.public_id).await, 4);
}

#[tokio::test]
async fn test_reconcile_with_stale_version() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;
    let a = h.account("stale.acct").await;

    let err = h
        .principals
        .add_principal_accounts(&ctx, &p.public_id, 7, &[a.public_id.as_str()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VersionConflict);
    assert_eq!(h.version(&p.public_id).await, 1);
}

#[tokio::test]
async fn test_set_accounts_is_idempotent() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;
    let a = h.account("set.one").await;
    let b = h.account("set.two").await;
    let c = h.account("set.three").await;

    let mut expected = vec![a.public_id.clone(), b.public_id.clone()];
    expected.sort();

    let first = h
        .principals
        .set_principal_accounts(&ctx, &p.public_id, 1, &[a.public_id.as_str(), b.public_id.as_str()])
        .await
        .unwrap();
    assert_eq!(first, expected);
    assert_eq!(h.version(&p.public_id).await, 2);
    let oplog_after_first = h.oplog.count().await.unwrap();

    // Same set, different order.
    let second = h
        .principals
        .set_principal_accounts(&ctx, &p.public_id, 2, &[b.public_id.as_str(), a.public_id.as_str()])
        .await
        .unwrap();
    assert_eq!(second, expected);
    assert_eq!(h.version(&p.public_id).await, 2);
    assert_eq!(h.oplog.count().await.unwrap(), oplog_after_first);

    // Swap b for c.
    let third = h
        .principals
        .set_principal_accounts(&ctx, &p.public_id, 2, &[a.public_id.as_str(), c.public_id.as_str()])
        .await
        .unwrap();
    let mut expected = vec![a.public_id.clone(), c.public_id.clone()];
    expected.sort();
    assert_eq!(third, expected);
    assert_eq!(h.version(&p.public_id).await, 3);

    let b_now = h.accounts.lookup_account(&ctx, &b.public_id).await.unwrap().unwrap();
    assert_eq!(b_now.principal_id, None);

    let none: [&str; 0] = [];
    let cleared = h
        .principals
        .set_principal_accounts(&ctx, &p.public_id, 3, &none)
        .await
        .unwrap();
    assert!(cleared.is_empty());
    assert_eq!(h.version(&p.public_id).await, 4);
}

#[tokio::test]
async fn test_oplog_matches_committed_state() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;
    let a = h.account("audit.acct").await;

    h.principals
        .add_principal_accounts(&ctx, &p.public_id, 1, &[a.public_id.as_str()])
        .await
        .unwrap();

    let principal_log = h.oplog.list_for_entity(&p.public_id).await.unwrap();
    let ops: Vec<_> = principal_log.iter().filter_map(|e| e.op()).collect();
    assert_eq!(ops, vec![OpType::Create, OpType::Update]);
    let update = &principal_log[1];
    assert_eq!(update.actor_id.as_deref(), Some("system"));
    let metadata = update.metadata().unwrap();
    assert_eq!(metadata.first("resource-public-id"), Some(p.public_id.as_str()));
    assert_eq!(metadata.first("op-type"), Some("update"));

    let account_log = h.oplog.list_for_entity(&a.public_id).await.unwrap();
    assert_eq!(account_log.len(), 2);
    // Relationship writes share the principal bump's transaction.
    assert_eq!(account_log[1].tx_id, update.tx_id);
    assert_eq!(
        account_log[1].metadata().unwrap().first("principal-id"),
        Some(p.public_id.as_str())
    );

    let tx_log = h.oplog.list_for_tx(&update.tx_id).await.unwrap();
    let mut entities: Vec<_> = tx_log.iter().map(|e| e.entity_id.as_str()).collect();
    entities.sort();
    let mut expected = vec![p.public_id.as_str(), a.public_id.as_str()];
    expected.sort();
    assert_eq!(entities, expected);
}

#[tokio::test]
async fn test_delete_principal_releases_accounts() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let p = h.principal().await;
    let a = h.account("orphan.acct").await;

    h.principals
        .add_principal_accounts(&ctx, &p.public_id, 1, &[a.public_id.as_str()])
        .await
        .unwrap();
    assert_eq!(h.principals.delete_principal(&ctx, &p.public_id).await.unwrap(), 1);

    let released = h.accounts.lookup_account(&ctx, &a.public_id).await.unwrap().unwrap();
    assert_eq!(released.principal_id, None);
    assert!(h.principals.lookup_principal(&ctx, &p.public_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_login_vivifies_principal_once() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let a = h.account("new.login").await;

    let opts = LoginOptions {
        name: Some("New Login".into()),
        description: None,
    };
    let first = h
        .principals
        .lookup_principal_with_login(&ctx, &a.public_id, opts.clone())
        .await
        .unwrap();
    assert_eq!(first.scope_id, GLOBAL_SCOPE_ID);
    assert_eq!(first.name.as_deref(), Some("New Login"));
    assert_eq!(first.version, 2);

    let again = h
        .principals
        .lookup_principal_with_login(&ctx, &a.public_id, opts)
        .await
        .unwrap();
    assert_eq!(again.public_id, first.public_id);
    assert_eq!(again.version, 2);

    let err = h
        .principals
        .lookup_principal_with_login(&ctx, "acctpw_missing", LoginOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecordNotFound);
}

#[tokio::test]
async fn test_login_outside_primary_auth_method_not_vivified() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let secondary = h
        .methods
        .create_auth_method(
            &ctx,
            &AuthMethod::new(GLOBAL_SCOPE_ID)
                .with_name("secondary")
                .with_configuration(h.method.configuration()),
        )
        .await
        .unwrap();
    let a = h
        .accounts
        .create_account(
            &ctx,
            &Account::new(&secondary.public_id, "side.door"),
            CreateAccountOptions::default(),
        )
        .await
        .unwrap();
    let oplog_before = h.oplog.count().await.unwrap();

    let err = h
        .principals
        .lookup_principal_with_login(&ctx, &a.public_id, LoginOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecordNotFound);

    let still_unowned = h.accounts.lookup_account(&ctx, &a.public_id).await.unwrap().unwrap();
    assert_eq!(still_unowned.principal_id, None);
    assert_eq!(h.oplog.count().await.unwrap(), oplog_before);

    // Once the secondary method becomes primary the same login vivifies.
    h.scopes
        .set_primary_auth_method(&ctx, GLOBAL_SCOPE_ID, &secondary.public_id)
        .await
        .unwrap();
    let principal = h
        .principals
        .lookup_principal_with_login(&ctx, &a.public_id, LoginOptions::default())
        .await
        .unwrap();
    let (_, accounts) = h
        .principals
        .lookup_principal(&ctx, &principal.public_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accounts, vec![a.public_id.clone()]);
}

#[tokio::test]
async fn test_concurrent_account_adds_on_shared_file() {
    pc_common::init_test_logging();

    let dir = tempfile::tempdir().unwrap();
    let database = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("race.db").display()),
        max_connections: 4,
        ..DatabaseConfig::default()
    };
    let store = Store::connect(&database).await.unwrap();
    store.migrate().await.unwrap();

    let config = RepositoryConfig::default();
    let ctx = ExecutionContext::system();
    let method = AuthMethodRepository::new(store.clone(), &config)
        .create_auth_method(
            &ctx,
            &AuthMethod::new(GLOBAL_SCOPE_ID).with_configuration(Configuration {
                argon2: Argon2Params::testing(),
                ..Configuration::default()
            }),
        )
        .await
        .unwrap();
    let wrapper: Arc<dyn Wrapper> = Arc::new(AeadWrapper::new("root", &generate_key()).unwrap());
    let accounts = AccountRepository::new(store.clone(), wrapper, &config);
    let principals = PrincipalRepository::new(store.clone(), &config);

    for round in 0..5 {
        let p = principals
            .create_principal(&ctx, &Principal::new(GLOBAL_SCOPE_ID))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for side in ["left", "right"] {
            let user_name = format!("{}.{}", side, round);
            let account = accounts
                .create_account(
                    &ctx,
                    &Account::new(&method.public_id, user_name),
                    CreateAccountOptions::default(),
                )
                .await
                .unwrap();
            ids.push(account.public_id);
        }

        let ids_a = [ids[0].as_str()];
        let ids_b = [ids[1].as_str()];
        let (a, b) = tokio::join!(
            principals.add_principal_accounts(&ctx, &p.public_id, 1, &ids_a),
            principals.add_principal_accounts(&ctx, &p.public_id, 1, &ids_b),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = a.err().or(b.err()).unwrap();
        assert_eq!(loser.kind(), ErrorKind::VersionConflict);

        let (current, owned) = principals.lookup_principal(&ctx, &p.public_id).await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(owned.len(), 1);
    }
}

#[tokio::test]
async fn test_delete_account_reports_rows() {
    let h = harness().await;
    let ctx = ExecutionContext::system();
    let a = h.account("gone.soon").await;

    assert_eq!(h.accounts.delete_account(&ctx, &a.public_id).await.unwrap(), 1);
    assert_eq!(h.accounts.delete_account(&ctx, &a.public_id).await.unwrap(), 0);
    assert!(h.accounts.lookup_account(&ctx, &a.public_id).await.unwrap().is_none());
}
