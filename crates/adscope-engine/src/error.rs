//! Engine error types.
//!
//! Validation failures stay distinguishable (out of quota vs. wrong plan
//! vs. not found); they are never collapsed into a generic failure.
//! Projection-sync failures are deliberately absent: the mirror is
//! non-authoritative, so those are logged and swallowed at the write site.

use thiserror::Error;

use adscope_firestore::FirestoreError;
use adscope_models::PlanTier;
use adscope_storage::StorageError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the entitlement engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No plan found for user {0}")]
    NotFound(String),

    #[error("Topup must stay on the current tier (current: {current}, requested: {requested})")]
    PlanMismatch {
        current: PlanTier,
        requested: PlanTier,
    },

    #[error("Upgrade target must rank above the current tier (current: {current}, requested: {requested})")]
    InvalidUpgrade {
        current: PlanTier,
        requested: PlanTier,
    },

    #[error("Monthly limit reached ({used} of {limit} ads this month)")]
    MonthlyLimitExceeded { used: u32, limit: u32 },

    #[error("No ads remaining in the plan")]
    BalanceExhausted,

    /// The remote analysis produced no usable result. Entitlement state is
    /// left untouched: a failed analysis is never charged.
    #[error("Analysis produced no usable result; no consumption was charged")]
    AnalysisFailed,

    /// The plan record changed between validation and commit. The analysis
    /// already performed is unbilled; the operation is safe to retry.
    #[error("Plan record was modified concurrently; the consumption was not charged")]
    ConcurrentModification,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Document store error: {0}")]
    Store(#[from] FirestoreError),

    #[error("Media storage error: {0}")]
    Media(#[from] StorageError),
}

impl EngineError {
    pub fn not_found(user_id: impl Into<String>) -> Self {
        Self::NotFound(user_id.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether this is a quota rejection (as opposed to an infrastructure
    /// failure or a bad request).
    pub fn is_quota_rejection(&self) -> bool {
        matches!(
            self,
            Self::MonthlyLimitExceeded { .. } | Self::BalanceExhausted
        )
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::InvalidRequest(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_rejections_are_classified() {
        assert!(EngineError::MonthlyLimitExceeded { used: 4, limit: 4 }.is_quota_rejection());
        assert!(EngineError::BalanceExhausted.is_quota_rejection());
        assert!(!EngineError::NotFound("u1".into()).is_quota_rejection());
        assert!(!EngineError::ConcurrentModification.is_quota_rejection());
    }

    #[test]
    fn test_rejections_stay_distinguishable() {
        let mismatch = EngineError::PlanMismatch {
            current: PlanTier::Lite,
            requested: PlanTier::Pro,
        };
        let upgrade = EngineError::InvalidUpgrade {
            current: PlanTier::Pro,
            requested: PlanTier::Lite,
        };
        assert_ne!(mismatch.to_string(), upgrade.to_string());
    }
}
