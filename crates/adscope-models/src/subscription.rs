//! Subscription plan records and quota snapshots.
//!
//! `PlanRecord` is the authoritative entitlement state for one user. It is
//! owned exclusively by the entitlement engine; every other surface reads the
//! best-effort `subscription.*` projection on the user profile instead.

use chrono::{DateTime, Days, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::plan::{Feature, PlanTier};

/// Authoritative entitlement state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanRecord {
    /// Owning user (also the document id).
    pub user_id: String,

    /// Current plan tier.
    pub plan_name: PlanTier,

    /// Start of the active billing window.
    pub subscription_start_date: DateTime<Utc>,

    /// End of the active billing window.
    pub subscription_end_date: DateTime<Utc>,

    /// Window length in days, as sold.
    pub validity_days: u32,

    /// Remaining lifetime ad-analysis balance.
    pub total_ads: u32,

    /// Cap on analyses within the current calendar month.
    pub max_ads_per_month: u32,

    /// Analyses consumed in the current calendar month.
    pub ads_used: u32,

    /// Instant of the last successful consumption, as stored (RFC3339).
    ///
    /// Kept as the raw string: legacy records can carry malformed values,
    /// and the billing-period policy decides how to treat those. Plan
    /// mutations never write this field; only committed consumptions do.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_usage_date: Option<String>,

    /// Capability tags enabled on this subscription.
    pub selected_features: Vec<Feature>,

    /// Cumulative amount charged across the record's history.
    pub total_price: f64,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl PlanRecord {
    /// Create a fresh record from a plan selection.
    ///
    /// The window starts at `now` and runs for the catalog duration; the
    /// balance and monthly cap come from the catalog unless the selection
    /// carries an override.
    pub fn activate(selection: &NewSubscription, now: DateTime<Utc>) -> Self {
        let spec = selection.plan.spec();
        let total_ads = selection.total_ads_override.unwrap_or(spec.total_ads);
        let features = selection
            .selected_features
            .clone()
            .unwrap_or_else(|| selection.plan.features());

        Self {
            user_id: selection.user_id.clone(),
            plan_name: selection.plan,
            subscription_start_date: now,
            subscription_end_date: add_days(now, spec.duration_days),
            validity_days: spec.duration_days,
            total_ads,
            max_ads_per_month: spec.max_ads_per_month,
            ads_used: 0,
            last_usage_date: None,
            selected_features: features,
            total_price: spec.price,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the billing window covers `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.subscription_end_date
    }

    /// Current quota numbers as a snapshot.
    pub fn quota(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            ads_used: self.ads_used,
            total_ads: self.total_ads,
            max_ads_per_month: self.max_ads_per_month,
        }
    }
}

/// Advance an instant by whole days.
pub fn add_days(instant: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    instant
        .checked_add_days(Days::new(days as u64))
        .unwrap_or(instant)
}

/// A plan selection: the input to subscription creation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    /// Owning user.
    #[validate(length(min = 1, message = "user id is required"))]
    pub user_id: String,

    /// Selected plan tier.
    pub plan: PlanTier,

    /// Capability tags chosen at purchase; defaults to the tier's full set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_features: Option<Vec<Feature>>,

    /// Custom ad balance, overriding the catalog default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ads_override: Option<u32>,
}

impl NewSubscription {
    /// Create a selection for a tier with catalog defaults.
    pub fn new(user_id: impl Into<String>, plan: PlanTier) -> Self {
        Self {
            user_id: user_id.into(),
            plan,
            selected_features: None,
            total_ads_override: None,
        }
    }

    /// Set an explicit feature selection.
    pub fn with_features(mut self, features: Vec<Feature>) -> Self {
        self.selected_features = Some(features);
        self
    }

    /// Set a custom ad balance.
    pub fn with_total_ads(mut self, total_ads: u32) -> Self {
        self.total_ads_override = Some(total_ads);
        self
    }
}

/// The three quota fields mirrored to the user profile after each commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub ads_used: u32,
    pub total_ads: u32,
    pub max_ads_per_month: u32,
}

/// Read-only plan summary, including the window a same-tier topup would buy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    pub user_id: String,
    pub plan_name: PlanTier,
    pub is_active: bool,
    pub subscription_start_date: DateTime<Utc>,
    pub subscription_end_date: DateTime<Utc>,
    pub days_remaining: i64,
    pub days_elapsed: i64,
    pub total_ads: u32,
    pub ads_used: u32,
    pub max_ads_per_month: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_usage_date: Option<String>,
    pub topup: TopupWindow,
}

/// What a same-tier topup would produce, given the current window.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopupWindow {
    /// Whether a back-to-back extension is possible (window still active).
    pub extends_current: bool,
    pub next_period_start: DateTime<Utc>,
    pub next_period_end: DateTime<Utc>,
    pub topup_ads: u32,
    pub topup_monthly_limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_activate_uses_catalog_defaults() {
        let now = instant(2024, 1, 10);
        let record = PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Plus), now);

        assert_eq!(record.plan_name, PlanTier::Plus);
        assert_eq!(record.total_ads, 30);
        assert_eq!(record.max_ads_per_month, 5);
        assert_eq!(record.ads_used, 0);
        assert_eq!(record.last_usage_date, None);
        assert_eq!(record.subscription_end_date, instant(2024, 7, 8));
        assert_eq!(record.selected_features.len(), 4);
        assert!((record.total_price - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_activate_honors_overrides() {
        let now = instant(2024, 1, 10);
        let selection = NewSubscription::new("u1", PlanTier::Lite)
            .with_total_ads(20)
            .with_features(vec![Feature::BrandCompliance]);
        let record = PlanRecord::activate(&selection, now);

        assert_eq!(record.total_ads, 20);
        assert_eq!(record.selected_features, vec![Feature::BrandCompliance]);
    }

    #[test]
    fn test_is_active_boundaries() {
        let now = instant(2024, 1, 10);
        let record = PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Lite), now);

        assert!(record.is_active(now));
        assert!(record.is_active(record.subscription_end_date));
        assert!(!record.is_active(instant(2024, 4, 10)));
    }

    #[test]
    fn test_new_subscription_requires_user_id() {
        use validator::Validate;

        let missing = NewSubscription::new("", PlanTier::Lite);
        assert!(missing.validate().is_err());
        assert!(NewSubscription::new("u1", PlanTier::Lite).validate().is_ok());
    }
}
