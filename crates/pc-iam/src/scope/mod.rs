//! Scope Aggregate
//!
//! Org and project boundaries that own principals and auth methods.

pub mod entity;
pub mod repository;

pub use entity::{Scope, ScopeType};
pub use repository::ScopeRepository;
