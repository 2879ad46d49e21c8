//! Oplog Aggregate
//!
//! Append-only record of every entity mutation. Entries are written by
//! [`Tx`](crate::store::Tx) inside the mutating transaction; this module
//! only reads them back.

pub mod entity;
pub mod repository;

pub use entity::{OpType, OplogEntry, OplogMetadata};
pub use repository::OplogRepository;
