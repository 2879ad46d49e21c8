//! Principal Aggregate
//!
//! User identities and their ownership of password accounts.

pub mod entity;
pub mod repository;

pub use entity::{parse_field_mask, LoginOptions, Principal};
pub use repository::PrincipalRepository;
