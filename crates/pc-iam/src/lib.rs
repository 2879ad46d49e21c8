//! Portcullis IAM
//!
//! Data-access core for identity and access control:
//! - Principals with optimistic-concurrency updates
//! - Password auth methods, accounts and envelope-encrypted credentials
//! - Principal/account ownership reconciliation
//! - An oplog written atomically with every mutation
//!
//! ## Module Organization (Aggregate-based)
//!
//! Each aggregate contains:
//! - `entity` - Domain entities
//! - `repository` - Data access
//!
//! All writes go through [`store::Store::do_tx`].

// Core aggregates
pub mod principal;
pub mod password;
pub mod scope;

// Audit
pub mod oplog;

// Shared infrastructure
pub mod shared;
pub mod store;

// Re-export common types from shared
pub use shared::error::{ErrorKind, PlatformError, Result, ResultExt};
pub use shared::execution_context::ExecutionContext;
pub use shared::public_id::new_public_id;

// Re-export main entity and repository types for convenience
pub use oplog::{OpType, OplogEntry, OplogMetadata, OplogRepository};
pub use password::{
    Account, AccountRepository, Argon2Params, AuthMethod, AuthMethodRepository, Configuration,
    CreateAccountOptions, Credential, ListOptions,
};
pub use principal::{LoginOptions, Principal, PrincipalRepository};
pub use scope::{Scope, ScopeRepository, ScopeType};
pub use store::{Store, GLOBAL_SCOPE_ID};
