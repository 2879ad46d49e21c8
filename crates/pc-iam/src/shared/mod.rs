//! Shared Module
//!
//! Cross-cutting types used by every aggregate.

pub mod error;
pub mod execution_context;
pub mod public_id;

pub use error::{ErrorKind, PlatformError, Result, ResultExt};
pub use execution_context::ExecutionContext;
pub use public_id::new_public_id;
