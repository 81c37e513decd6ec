//! Ad analysis requests, outcomes, and archived results.
//!
//! An analysis runs one or more AI features against an uploaded ad. The
//! engine bills a consumption only when the outcome carries at least one
//! successful feature result; `AnalysisVerdict` captures that decision.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::plan::PlanTier;

/// Content types accepted for ad images.
pub const ALLOWED_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

/// Content types accepted for ad videos.
pub const ALLOWED_VIDEO_TYPES: &[&str] = &[
    "video/mp4",
    "video/avi",
    "video/mov",
    "video/wmv",
    "video/flv",
    "video/webm",
];

/// Broad media category, derived from the content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a content type, rejecting anything outside the allow lists.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        if ALLOWED_VIDEO_TYPES.contains(&content_type) {
            Some(MediaKind::Video)
        } else if ALLOWED_IMAGE_TYPES.contains(&content_type) {
            Some(MediaKind::Image)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// Context fields accompanying an analysis request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    /// Requesting user.
    #[validate(length(min = 1, message = "user id is required"))]
    pub user_id: String,

    /// Brand the ad belongs to.
    #[validate(length(min = 1, message = "brand id is required"))]
    pub brand_id: String,

    /// Display title for the ad library.
    #[serde(default)]
    pub ad_title: String,

    /// What the ad is trying to say.
    #[serde(default)]
    pub message_intent: String,

    /// Funnel stage the ad targets.
    #[serde(default)]
    pub funnel_stage: String,

    /// Distribution channels the ad will run on.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Originating surface.
    #[serde(default)]
    pub source: String,

    /// Caller-side correlation id.
    #[serde(default)]
    pub client_id: String,
}

/// Result of a single analysis feature.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FeatureResult {
    /// Whether the feature produced a usable result.
    pub success: bool,

    /// Structured result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Upstream HTTP status, when the failure came from the remote service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl FeatureResult {
    /// A successful result carrying a payload.
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            status_code: None,
        }
    }

    /// A failed result with error detail.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            status_code: None,
        }
    }

    /// A failed result carrying the upstream HTTP status.
    pub fn failed_with_status(error: impl Into<String>, status_code: u16) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            status_code: Some(status_code),
        }
    }
}

/// Per-feature results of one analysis call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisOutcome {
    /// Feature name -> result, in stable order.
    pub results: BTreeMap<String, FeatureResult>,
}

impl AnalysisOutcome {
    /// An outcome where every requested feature failed with the same error.
    ///
    /// Used when the remote call itself failed (timeout, transport error):
    /// the settlement decision then sees zero successes and declines to bill.
    pub fn all_failed(features: &[&str], error: impl Into<String>) -> Self {
        let error = error.into();
        let results = features
            .iter()
            .map(|f| (f.to_string(), FeatureResult::failed(error.clone())))
            .collect();
        Self { results }
    }

    /// Insert a single feature result.
    pub fn insert(&mut self, feature: impl Into<String>, result: FeatureResult) {
        self.results.insert(feature.into(), result);
    }

    /// Names of the features that succeeded.
    pub fn successful_features(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Names of the features that failed.
    pub fn failed_features(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| !r.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Collapse into the billing verdict.
    pub fn verdict(&self) -> AnalysisVerdict {
        AnalysisVerdict {
            attempted: self.results.len() as u32,
            succeeded: self.results.values().filter(|r| r.success).count() as u32,
        }
    }
}

/// Success accounting for one analysis, driving the billing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisVerdict {
    /// Features attempted.
    pub attempted: u32,
    /// Features that produced a usable result.
    pub succeeded: u32,
}

impl AnalysisVerdict {
    /// Whether the analysis is commit-worthy: at least one usable result.
    pub fn is_billable(&self) -> bool {
        self.succeeded >= 1
    }

    /// Fraction of attempted features that succeeded (0.0 when none ran).
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.attempted as f64
    }

    /// Billable but with less than half of the attempted features succeeding.
    pub fn is_degraded(&self) -> bool {
        self.is_billable() && self.success_rate() < 0.5
    }
}

/// Plan usage captured at commit time, stored with the analysis.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageAtAnalysis {
    pub ads_used: u32,
    pub max_ads_per_month: u32,
    pub total_ads_remaining: u32,
    pub plan_name: PlanTier,
}

/// Archived record of a completed (billed) analysis.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    /// Unique artifact id (also the document id).
    pub artifact_id: String,
    pub user_id: String,
    pub brand_id: String,
    pub ad_title: String,
    pub message_intent: String,
    pub funnel_stage: String,
    pub channels: Vec<String>,
    pub source: String,
    pub client_id: String,

    /// Signed URL issued for the stored media at analysis time.
    pub media_url: String,
    pub media_content_type: String,
    pub media_kind: MediaKind,
    /// Blob-store key of the uploaded media.
    pub storage_key: String,

    /// Per-feature results as returned by the analysis service.
    pub results: BTreeMap<String, FeatureResult>,

    /// Quota numbers right after the consumption was committed.
    pub usage: UsageAtAnalysis,

    pub created_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// Assemble a record from a billed analysis.
    pub fn from_outcome(
        artifact_id: impl Into<String>,
        context: &AnalysisContext,
        media_url: impl Into<String>,
        media_content_type: impl Into<String>,
        media_kind: MediaKind,
        storage_key: impl Into<String>,
        outcome: &AnalysisOutcome,
        usage: UsageAtAnalysis,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            user_id: context.user_id.clone(),
            brand_id: context.brand_id.clone(),
            ad_title: context.ad_title.clone(),
            message_intent: context.message_intent.clone(),
            funnel_stage: context.funnel_stage.clone(),
            channels: context.channels.clone(),
            source: context.source.clone(),
            client_id: context.client_id.clone(),
            media_url: media_url.into(),
            media_content_type: media_content_type.into(),
            media_kind,
            storage_key: storage_key.into(),
            results: outcome.results.clone(),
            usage,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_classification() {
        assert_eq!(MediaKind::from_content_type("image/png"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_content_type("video/mp4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_content_type("application/pdf"), None);
    }

    #[test]
    fn test_verdict_billable_threshold() {
        let mut outcome = AnalysisOutcome::default();
        outcome.insert("comprehensive_analysis", FeatureResult::failed("boom"));
        assert!(!outcome.verdict().is_billable());

        outcome.insert("brand_compliance", FeatureResult::ok(json!({"score": 0.9})));
        let verdict = outcome.verdict();
        assert!(verdict.is_billable());
        assert_eq!(verdict.succeeded, 1);
        assert_eq!(verdict.attempted, 2);
    }

    #[test]
    fn test_verdict_degraded_below_half() {
        let verdict = AnalysisVerdict {
            attempted: 3,
            succeeded: 1,
        };
        assert!(verdict.is_billable());
        assert!(verdict.is_degraded());

        let healthy = AnalysisVerdict {
            attempted: 2,
            succeeded: 1,
        };
        assert!(!healthy.is_degraded());
    }

    #[test]
    fn test_all_failed_outcome_has_zero_successes() {
        let outcome = AnalysisOutcome::all_failed(&["comprehensive_analysis"], "timeout");
        assert_eq!(outcome.verdict().succeeded, 0);
        assert_eq!(outcome.failed_features(), vec!["comprehensive_analysis"]);
    }

    #[test]
    fn test_context_validation() {
        use validator::Validate;

        let context = AnalysisContext {
            user_id: "u1".to_string(),
            brand_id: String::new(),
            ad_title: String::new(),
            message_intent: String::new(),
            funnel_stage: String::new(),
            channels: vec![],
            source: String::new(),
            client_id: String::new(),
        };
        assert!(context.validate().is_err());
    }
}
