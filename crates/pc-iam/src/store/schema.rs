//! Schema DDL
//!
//! Applied idempotently by [`Store::migrate`](super::Store::migrate).
//! Timestamps are stored as RFC 3339 text bound from Rust.

pub const GLOBAL_SCOPE_ID: &str = "global";

pub(crate) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS iam_scope (
        public_id TEXT PRIMARY KEY,
        parent_id TEXT REFERENCES iam_scope (public_id) ON DELETE CASCADE,
        scope_type TEXT NOT NULL CHECK (scope_type IN ('global', 'org', 'project')),
        name TEXT,
        description TEXT,
        primary_auth_method_id TEXT,
        create_time TEXT NOT NULL,
        update_time TEXT NOT NULL,
        UNIQUE (parent_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS iam_principal (
        public_id TEXT PRIMARY KEY,
        scope_id TEXT NOT NULL REFERENCES iam_scope (public_id) ON DELETE CASCADE,
        name TEXT,
        description TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        create_time TEXT NOT NULL,
        update_time TEXT NOT NULL,
        UNIQUE (scope_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_password_method (
        public_id TEXT PRIMARY KEY,
        scope_id TEXT NOT NULL REFERENCES iam_scope (public_id) ON DELETE CASCADE,
        name TEXT,
        description TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        min_user_name_length INTEGER NOT NULL,
        min_password_length INTEGER NOT NULL,
        argon2_iterations INTEGER NOT NULL,
        argon2_memory INTEGER NOT NULL,
        argon2_threads INTEGER NOT NULL,
        argon2_salt_length INTEGER NOT NULL,
        argon2_key_length INTEGER NOT NULL,
        create_time TEXT NOT NULL,
        update_time TEXT NOT NULL,
        UNIQUE (scope_id, name)
    )
    "#,
    // principal_id is the ownership edge: one owner per account at most.
    r#"
    CREATE TABLE IF NOT EXISTS auth_password_account (
        public_id TEXT PRIMARY KEY,
        auth_method_id TEXT NOT NULL REFERENCES auth_password_method (public_id) ON DELETE CASCADE,
        scope_id TEXT NOT NULL REFERENCES iam_scope (public_id) ON DELETE CASCADE,
        principal_id TEXT REFERENCES iam_principal (public_id) ON DELETE SET NULL,
        user_name TEXT NOT NULL,
        name TEXT,
        description TEXT,
        create_time TEXT NOT NULL,
        update_time TEXT NOT NULL,
        UNIQUE (auth_method_id, name),
        UNIQUE (auth_method_id, user_name)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS auth_password_account_principal_idx
        ON auth_password_account (principal_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS auth_password_credential (
        password_account_id TEXT PRIMARY KEY
            REFERENCES auth_password_account (public_id) ON DELETE CASCADE,
        password_method_id TEXT NOT NULL
            REFERENCES auth_password_method (public_id) ON DELETE CASCADE,
        ct_credential BLOB NOT NULL,
        key_id TEXT NOT NULL,
        iterations INTEGER NOT NULL,
        memory INTEGER NOT NULL,
        threads INTEGER NOT NULL,
        key_length INTEGER NOT NULL,
        create_time TEXT NOT NULL,
        update_time TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oplog_entry (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tx_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        op_type TEXT NOT NULL CHECK (op_type IN ('create', 'update', 'delete')),
        metadata TEXT NOT NULL,
        actor_id TEXT,
        correlation_id TEXT,
        create_time TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS oplog_entry_entity_idx
        ON oplog_entry (entity_id, op_type)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS oplog_entry_tx_idx
        ON oplog_entry (tx_id)
    "#,
];
