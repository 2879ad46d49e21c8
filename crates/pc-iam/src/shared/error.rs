//! Platform Error Types
//!
//! Every repository failure carries an [`ErrorKind`] plus the chain of
//! operation frames it passed through on the way out. Callers branch on
//! the kind; the rendered chain is for humans and logs.
//!
//! ```ignore
//! use pc_iam::{ErrorKind, ResultExt};
//!
//! let principal = repo.update_principal(&ctx, &p, 3, &["name"]).await;
//! match principal {
//!     Err(e) if e.kind() == ErrorKind::VersionConflict => { /* re-read and retry */ }
//!     other => other?,
//! }
//! ```

use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a failure, stable across message wording changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing input, caught before any I/O
    InvalidParameter,
    /// Name collision within a scope or auth method
    NotUnique,
    RecordNotFound,
    /// An id-keyed write affected more than one row
    MultipleRecords,
    /// Version predicate matched zero rows though the id exists
    VersionConflict,
    /// Account is owned by a different principal
    AccountAlreadyAssociated,
    TooShort,
    EmptyFieldMask,
    InvalidFieldMask,
    Encryption,
    /// Serialization failure or lock contention, retried by the executor
    Transient,
    Storage,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::NotUnique => "unique constraint violation",
            ErrorKind::RecordNotFound => "record not found",
            ErrorKind::MultipleRecords => "multiple records",
            ErrorKind::VersionConflict => "version conflict",
            ErrorKind::AccountAlreadyAssociated => "account already associated",
            ErrorKind::TooShort => "too short",
            ErrorKind::EmptyFieldMask => "empty field mask",
            ErrorKind::InvalidFieldMask => "invalid field mask",
            ErrorKind::Encryption => "encryption failure",
            ErrorKind::Transient => "transient storage conflict",
            ErrorKind::Storage => "storage failure",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("{}", render(.context, .kind, .message))]
pub struct PlatformError {
    kind: ErrorKind,
    message: String,
    /// Innermost frame first
    context: Vec<String>,
    #[source]
    source: Option<BoxError>,
}

fn render(context: &[String], kind: &ErrorKind, message: &str) -> String {
    let mut out = String::new();
    for frame in context.iter().rev() {
        out.push_str(frame);
        out.push_str(": ");
    }
    if message.is_empty() {
        out.push_str(kind.as_str());
    } else {
        out.push_str(message);
    }
    out
}

impl PlatformError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn not_unique(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotUnique, message)
    }

    pub fn record_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RecordNotFound, message)
    }

    pub fn multiple_records(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MultipleRecords, message)
    }

    pub fn version_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::VersionConflict, message)
    }

    pub fn account_already_associated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccountAlreadyAssociated, message)
    }

    pub fn too_short(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooShort, message)
    }

    pub fn empty_field_mask() -> Self {
        Self::new(ErrorKind::EmptyFieldMask, "")
    }

    pub fn invalid_field_mask(field: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFieldMask, format!("invalid field mask: {}", field.into()))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add an outer frame, e.g. the operation and entity being worked on.
    pub fn context(mut self, frame: impl Into<String>) -> Self {
        self.context.push(frame.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Context frames, outermost first.
    pub fn frames(&self) -> impl Iterator<Item = &str> {
        self.context.iter().rev().map(String::as_str)
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Frame annotation on results, mirroring `PlatformError::context`.
pub trait ResultExt<T> {
    fn context(self, frame: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, frame: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, frame: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(frame))
    }

    fn with_context<F, S>(self, frame: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(frame()))
    }
}

/// SQLite primary/extended codes for BUSY and LOCKED, plus Postgres
/// serialization failure and deadlock.
const TRANSIENT_CODES: &[&str] = &["5", "6", "261", "262", "517", "40001", "40P01"];

fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::RowNotFound => ErrorKind::RecordNotFound,
        sqlx::Error::PoolTimedOut => ErrorKind::Transient,
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                ErrorKind::NotUnique
            } else if db.is_foreign_key_violation() {
                ErrorKind::RecordNotFound
            } else if db
                .code()
                .map(|code| TRANSIENT_CODES.contains(&code.as_ref()))
                .unwrap_or(false)
            {
                ErrorKind::Transient
            } else {
                ErrorKind::Storage
            }
        }
        _ => ErrorKind::Storage,
    }
}

impl From<sqlx::Error> for PlatformError {
    fn from(err: sqlx::Error) -> Self {
        let kind = classify(&err);
        PlatformError::new(kind, err.to_string()).with_source(err)
    }
}

impl From<pc_kms::KmsError> for PlatformError {
    fn from(err: pc_kms::KmsError) -> Self {
        PlatformError::new(ErrorKind::Encryption, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::internal(format!("serialization: {}", err)).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_render_outermost_first() {
        let err = PlatformError::record_not_found("no row for u_123")
            .context("lookup principal")
            .context("update principal");
        assert_eq!(
            err.to_string(),
            "update principal: lookup principal: no row for u_123"
        );
        assert_eq!(
            err.frames().collect::<Vec<_>>(),
            vec!["update principal", "lookup principal"]
        );
        assert_eq!(err.message(), "no row for u_123");
    }

    #[test]
    fn test_kind_survives_context() {
        let err: Result<()> = Err(PlatformError::version_conflict("expected 2"));
        let err = err.context("update").with_context(|| format!("principal {}", "u_1"));
        let err = err.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionConflict);
        assert!(err.is(ErrorKind::VersionConflict));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_empty_message_renders_kind() {
        let err = PlatformError::empty_field_mask().context("update principal");
        assert_eq!(err.to_string(), "update principal: empty field mask");
    }

    #[test]
    fn test_invalid_field_mask_names_field() {
        let err = PlatformError::invalid_field_mask("CreateTime");
        assert_eq!(err.kind(), ErrorKind::InvalidFieldMask);
        assert!(err.to_string().contains("CreateTime"));
    }

    #[test]
    fn test_sqlx_row_not_found_classified() {
        let err = PlatformError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::RecordNotFound);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = PlatformError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_kms_error_is_encryption() {
        let err = PlatformError::from(pc_kms::KmsError::InvalidKey("short".into()));
        assert_eq!(err.kind(), ErrorKind::Encryption);
    }
}
