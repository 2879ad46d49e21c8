//! Portcullis Common
//!
//! Plumbing shared by the Portcullis binaries and test suites.

pub mod logging;

pub use logging::{init_logging, init_test_logging};
