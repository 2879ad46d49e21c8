//! Password Auth Aggregate
//!
//! Password auth methods, the accounts under them and their credentials.

pub mod account;
pub mod auth_method;
pub mod auth_method_repository;
pub mod credential;
pub mod repository;

pub use account::{Account, CreateAccountOptions, ListOptions};
pub use auth_method::{AuthMethod, Configuration};
pub use auth_method_repository::AuthMethodRepository;
pub use credential::{Argon2Params, Credential};
pub use repository::AccountRepository;
