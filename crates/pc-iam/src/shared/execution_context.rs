//! Execution Context
//!
//! Carries the acting principal, tracing ids and a cancellation token
//! through one repository call. The actor and correlation id are copied
//! into every oplog entry the call writes.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::shared::error::{PlatformError, Result};
use crate::shared::public_id::new_public_id;

pub const SYSTEM_PRINCIPAL: &str = "system";

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Unique ID for this execution (generated)
    pub execution_id: String,
    /// ID for distributed tracing, usually from the original request
    pub correlation_id: String,
    /// ID of the principal performing the action
    pub principal_id: String,
    pub initiated_at: DateTime<Utc>,
    cancel: CancellationToken,
}

fn execution_id() -> String {
    new_public_id("exec").unwrap_or_else(|_| format!("exec_{}", Utc::now().timestamp_micros()))
}

impl ExecutionContext {
    /// Fresh context; the correlation id starts as the execution id.
    pub fn create(principal_id: impl Into<String>) -> Self {
        let exec_id = execution_id();
        Self {
            execution_id: exec_id.clone(),
            correlation_id: exec_id,
            principal_id: principal_id.into(),
            initiated_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_correlation(
        principal_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::create(principal_id)
        }
    }

    /// Context for work initiated by the platform itself (bootstrap, vivify).
    pub fn system() -> Self {
        Self::create(SYSTEM_PRINCIPAL)
    }

    /// Tie this context to an externally owned token, e.g. a request's.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PlatformError::canceled(format!(
                "execution {} canceled",
                self.execution_id
            )));
        }
        Ok(())
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
