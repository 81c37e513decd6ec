//! Shared data models for the Adscope backend.
//!
//! This crate provides Serde-serializable types for:
//! - The plan catalog (tiers, quotas, prices, capability tags)
//! - Subscription plan records and their quota snapshots
//! - Ad analysis requests, outcomes, and archived results

pub mod analysis;
pub mod plan;
pub mod subscription;

// Re-export common types
pub use analysis::{
    AnalysisContext, AnalysisOutcome, AnalysisRecord, AnalysisVerdict, FeatureResult, MediaKind,
    UsageAtAnalysis,
};
pub use plan::{Feature, PlanSpec, PlanTier};
pub use subscription::{NewSubscription, PlanRecord, PlanStatus, QuotaSnapshot, TopupWindow};
