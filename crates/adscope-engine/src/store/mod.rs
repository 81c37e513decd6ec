//! Storage seams of the entitlement engine.
//!
//! Three traits separate the engine from its collaborators: `PlanStore`
//! (the authoritative record, with per-field patches and an optimistic
//! revision check), `ProfileMirrorStore` (the best-effort projection), and
//! `AnalysisArchive` (history of billed analyses). The Firestore
//! implementation backs production; the in-memory one backs tests and local
//! development, and is where a different locking strategy could be swapped
//! in at the commit boundary without touching call sites.

pub mod firestore;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use adscope_models::{AnalysisRecord, Feature, PlanRecord, PlanTier, QuotaSnapshot};

use crate::error::EngineResult;

pub use firestore::FirestoreStores;
pub use memory::MemoryStores;

/// Collection names in the document store.
pub mod collections {
    /// Authoritative plan records, one per user (doc id = user id).
    pub const PLAN_SELECTIONS: &str = "plan_selections";
    /// User profile documents carrying the `subscription.*` projection.
    pub const USER_PROFILES: &str = "user_profiles";
    /// Archived analyses (doc id = artifact id).
    pub const AD_ANALYSES: &str = "ad_analyses";
}

/// A plan record together with its store revision.
///
/// The revision is an opaque token (Firestore's `updateTime`); `None` when
/// the backend does not expose one. It guards commit-time writes against
/// concurrent modification.
#[derive(Debug, Clone)]
pub struct VersionedPlan {
    pub record: PlanRecord,
    pub revision: Option<String>,
}

/// Per-field update of a plan record.
///
/// Only the fields a caller explicitly sets are written, so concurrent
/// unrelated writes (a feature-list change racing a monthly reset) are not
/// clobbered. Plan mutations that rewrite the whole record go through
/// `PlanStore::save` instead.
#[derive(Debug, Clone, Default)]
pub struct PlanPatch {
    pub ads_used: Option<u32>,
    pub total_ads: Option<u32>,
    pub max_ads_per_month: Option<u32>,
    pub last_usage_date: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PlanPatch {
    pub fn ads_used(mut self, value: u32) -> Self {
        self.ads_used = Some(value);
        self
    }

    pub fn total_ads(mut self, value: u32) -> Self {
        self.total_ads = Some(value);
        self
    }

    pub fn max_ads_per_month(mut self, value: u32) -> Self {
        self.max_ads_per_month = Some(value);
        self
    }

    pub fn last_usage_date(mut self, value: DateTime<Utc>) -> Self {
        self.last_usage_date = Some(value);
        self
    }

    pub fn updated_at(mut self, value: DateTime<Utc>) -> Self {
        self.updated_at = Some(value);
        self
    }

    /// Apply the patch to an in-memory record.
    pub fn apply_to(&self, record: &mut PlanRecord) {
        if let Some(v) = self.ads_used {
            record.ads_used = v;
        }
        if let Some(v) = self.total_ads {
            record.total_ads = v;
        }
        if let Some(v) = self.max_ads_per_month {
            record.max_ads_per_month = v;
        }
        if let Some(v) = self.last_usage_date {
            record.last_usage_date = Some(v.to_rfc3339());
        }
        if let Some(v) = self.updated_at {
            record.updated_at = v;
        }
    }
}

/// Authoritative plan record storage.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Load a record with its revision; `None` when the user has no plan.
    async fn load(&self, user_id: &str) -> EngineResult<Option<VersionedPlan>>;

    /// Write the full record (create or replace).
    async fn save(&self, record: &PlanRecord) -> EngineResult<()>;

    /// Apply a per-field patch to an existing record.
    async fn apply(&self, user_id: &str, patch: PlanPatch) -> EngineResult<()>;

    /// Apply a per-field patch only if the record still has the given
    /// revision. Fails with `ConcurrentModification` otherwise.
    async fn apply_if_unchanged(
        &self,
        user_id: &str,
        patch: PlanPatch,
        revision: &str,
    ) -> EngineResult<()>;

    /// Delete the record (administrative reset).
    async fn delete(&self, user_id: &str) -> EngineResult<()>;

    /// Page through all records; returns the page and the next page token.
    async fn list_page(
        &self,
        page_size: u32,
        page_token: Option<String>,
    ) -> EngineResult<(Vec<PlanRecord>, Option<String>)>;
}

/// Partial update of the `subscription.*` projection on a user profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorPatch {
    pub plan_name: Option<PlanTier>,
    pub ad_quota: Option<u32>,
    pub ads_used: Option<u32>,
    pub max_ads_per_month: Option<u32>,
    pub total_price: Option<f64>,
    pub subscription_start_date: Option<DateTime<Utc>>,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub validity_days: Option<u32>,
    pub selected_features: Option<Vec<Feature>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MirrorPatch {
    /// The quota-only patch propagated after each committed consumption.
    pub fn quota(snapshot: QuotaSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            ad_quota: Some(snapshot.total_ads),
            ads_used: Some(snapshot.ads_used),
            max_ads_per_month: Some(snapshot.max_ads_per_month),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    /// The full projection of a plan record, used by mutations and repair.
    pub fn full(record: &PlanRecord, now: DateTime<Utc>) -> Self {
        Self {
            plan_name: Some(record.plan_name),
            ad_quota: Some(record.total_ads),
            ads_used: Some(record.ads_used),
            max_ads_per_month: Some(record.max_ads_per_month),
            total_price: Some(record.total_price),
            subscription_start_date: Some(record.subscription_start_date),
            subscription_end_date: Some(record.subscription_end_date),
            validity_days: Some(record.validity_days),
            selected_features: Some(record.selected_features.clone()),
            updated_at: Some(now),
        }
    }

    /// Merge another patch over this one (fields present in `other` win).
    pub fn merge_from(&mut self, other: MirrorPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(plan_name);
        take!(ad_quota);
        take!(ads_used);
        take!(max_ads_per_month);
        take!(total_price);
        take!(subscription_start_date);
        take!(subscription_end_date);
        take!(validity_days);
        take!(selected_features);
        take!(updated_at);
    }
}

/// Best-effort projection of entitlement state onto the user profile.
///
/// Never authoritative: the engine writes it and repairs it, but never
/// reads entitlement truth back from it.
#[async_trait]
pub trait ProfileMirrorStore: Send + Sync {
    /// Merge projection fields into the profile, creating it if needed.
    async fn merge_subscription(&self, user_id: &str, patch: MirrorPatch) -> EngineResult<()>;

    /// Remove the whole projection (administrative reset).
    async fn clear_subscription(&self, user_id: &str) -> EngineResult<()>;
}

/// Archive of billed analyses.
#[async_trait]
pub trait AnalysisArchive: Send + Sync {
    async fn record(&self, analysis: &AnalysisRecord) -> EngineResult<()>;

    async fn get(&self, artifact_id: &str) -> EngineResult<Option<AnalysisRecord>>;

    /// Analyses belonging to one user, most recent first.
    async fn list_for_user(&self, user_id: &str, limit: u32)
        -> EngineResult<Vec<AnalysisRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use adscope_models::NewSubscription;
    use chrono::TimeZone;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let now = instant(2024, 3, 1);
        let mut record = PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Lite), now);
        record.ads_used = 2;

        let patch = PlanPatch::default().total_ads(7).updated_at(instant(2024, 3, 2));
        patch.apply_to(&mut record);

        assert_eq!(record.total_ads, 7);
        assert_eq!(record.ads_used, 2); // untouched
        assert_eq!(record.updated_at, instant(2024, 3, 2));
        assert_eq!(record.last_usage_date, None); // untouched
    }

    #[test]
    fn test_mirror_patch_merge_prefers_newer_fields() {
        let now = instant(2024, 3, 1);
        let record = PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Plus), now);

        let mut merged = MirrorPatch::full(&record, now);
        merged.merge_from(MirrorPatch::quota(
            QuotaSnapshot {
                ads_used: 1,
                total_ads: 29,
                max_ads_per_month: 5,
            },
            instant(2024, 3, 2),
        ));

        assert_eq!(merged.ads_used, Some(1));
        assert_eq!(merged.ad_quota, Some(29));
        // Fields absent from the quota patch survive
        assert_eq!(merged.plan_name, Some(PlanTier::Plus));
        assert_eq!(merged.updated_at, Some(instant(2024, 3, 2)));
    }
}
