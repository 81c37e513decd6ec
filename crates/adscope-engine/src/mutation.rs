//! Plan lifecycle mutations: subscribe, topup, upgrade, status, repair.
//!
//! Topups extend the same tier; upgrades move strictly up the hierarchy.
//! Every mutation applies the billing-period policy before reading the
//! monthly counter, so stale usage from a previous month never leaks into
//! the new plan math. `last_usage_date` is never written here; only actual
//! consumption updates it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use validator::Validate;

use adscope_models::subscription::add_days;
use adscope_models::{
    Feature, NewSubscription, PlanRecord, PlanStatus, PlanTier, QuotaSnapshot, TopupWindow,
};

use crate::billing::BillingPeriodPolicy;
use crate::error::{EngineError, EngineResult};
use crate::projection::merge_full_projection;
use crate::store::{PlanPatch, PlanStore, ProfileMirrorStore};

/// State transitions over a user's plan record.
pub struct PlanMutationEngine {
    plans: Arc<dyn PlanStore>,
    mirror: Arc<dyn ProfileMirrorStore>,
}

impl PlanMutationEngine {
    pub fn new(plans: Arc<dyn PlanStore>, mirror: Arc<dyn ProfileMirrorStore>) -> Self {
        Self { plans, mirror }
    }

    /// Create a plan record from a fresh selection and project it.
    pub async fn subscribe(
        &self,
        selection: &NewSubscription,
        now: DateTime<Utc>,
    ) -> EngineResult<PlanRecord> {
        selection.validate()?;

        let record = PlanRecord::activate(selection, now);
        self.plans.save(&record).await?;
        merge_full_projection(&self.mirror, &record, now).await;

        info!(
            user_id = %record.user_id,
            plan = %record.plan_name,
            total_ads = record.total_ads,
            "Created subscription"
        );
        Ok(record)
    }

    /// Same-tier renewal/extension.
    ///
    /// While the window is still active the new period starts the day after
    /// the current end (back-to-back, no gap) and the balance is additive;
    /// after expiry the window restarts at `now` and the balance is
    /// replaced, forfeiting any leftover. The monthly cap is always
    /// overwritten with the catalog value, because the tier is unchanged.
    pub async fn topup(
        &self,
        user_id: &str,
        requested: PlanTier,
        features: Option<Vec<Feature>>,
        total_ads_override: Option<u32>,
        now: DateTime<Utc>,
    ) -> EngineResult<PlanRecord> {
        let mut record = self.load_record(user_id).await?;

        if requested != record.plan_name {
            return Err(EngineError::PlanMismatch {
                current: record.plan_name,
                requested,
            });
        }

        let spec = requested.spec();
        let topup_ads = total_ads_override.unwrap_or(spec.total_ads);
        let (effective_used, _) = BillingPeriodPolicy::effective_ads_used(&record, now);
        let expired = now > record.subscription_end_date;

        if expired {
            // Fresh start: prior leftover forfeited, new billing cycle
            record.subscription_start_date = now;
            record.total_ads = topup_ads;
            record.ads_used = 0;
        } else {
            // Back-to-back extension within the same billing cycle
            record.subscription_start_date = add_days(record.subscription_end_date, 1);
            record.total_ads += topup_ads;
            record.ads_used = effective_used;
        }
        record.subscription_end_date = add_days(record.subscription_start_date, spec.duration_days);
        record.validity_days = spec.duration_days;
        record.max_ads_per_month = spec.max_ads_per_month;
        record.total_price += spec.price;
        record.updated_at = now;
        if let Some(features) = features {
            if !features.is_empty() {
                record.selected_features = features;
            }
        }

        self.plans.save(&record).await?;
        merge_full_projection(&self.mirror, &record, now).await;

        info!(
            user_id = %user_id,
            plan = %requested,
            expired,
            total_ads = record.total_ads,
            "Topped up plan"
        );
        Ok(record)
    }

    /// Move to a strictly higher tier.
    ///
    /// The window restarts at `now` (no carry-over of remaining time), the
    /// remaining balance carries forward on top of the new plan's ads, the
    /// monthly caps combine, and the full feature set of the target tier is
    /// granted. Monthly usage is preserved.
    pub async fn upgrade(
        &self,
        user_id: &str,
        requested: PlanTier,
        total_ads_override: Option<u32>,
        now: DateTime<Utc>,
    ) -> EngineResult<PlanRecord> {
        let mut record = self.load_record(user_id).await?;

        if requested.rank() <= record.plan_name.rank() {
            return Err(EngineError::InvalidUpgrade {
                current: record.plan_name,
                requested,
            });
        }

        let spec = requested.spec();
        let new_plan_ads = total_ads_override.unwrap_or(spec.total_ads);
        let (effective_used, _) = BillingPeriodPolicy::effective_ads_used(&record, now);
        let previous = record.plan_name;

        record.plan_name = requested;
        record.subscription_start_date = now;
        record.subscription_end_date = add_days(now, spec.duration_days);
        record.validity_days = spec.duration_days;
        record.total_ads += new_plan_ads;
        record.max_ads_per_month += spec.max_ads_per_month;
        record.selected_features = requested.features();
        record.ads_used = effective_used;
        record.total_price += spec.price;
        record.updated_at = now;

        self.plans.save(&record).await?;
        merge_full_projection(&self.mirror, &record, now).await;

        info!(
            user_id = %user_id,
            from = %previous,
            to = %requested,
            total_ads = record.total_ads,
            max_ads_per_month = record.max_ads_per_month,
            "Upgraded plan"
        );
        Ok(record)
    }

    /// Read-only plan summary, including the window a topup would buy.
    pub async fn plan_status(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<PlanStatus> {
        let record = self.load_record(user_id).await?;
        let spec = record.plan_name.spec();
        let is_active = record.is_active(now);

        let next_period_start = if is_active {
            add_days(record.subscription_end_date, 1)
        } else {
            now
        };

        Ok(PlanStatus {
            user_id: record.user_id.clone(),
            plan_name: record.plan_name,
            is_active,
            subscription_start_date: record.subscription_start_date,
            subscription_end_date: record.subscription_end_date,
            days_remaining: if is_active {
                (record.subscription_end_date - now).num_days()
            } else {
                0
            },
            days_elapsed: if now >= record.subscription_start_date {
                (now - record.subscription_start_date).num_days()
            } else {
                0
            },
            total_ads: record.total_ads,
            ads_used: record.ads_used,
            max_ads_per_month: record.max_ads_per_month,
            last_usage_date: record.last_usage_date.clone(),
            topup: TopupWindow {
                extends_current: is_active,
                next_period_start,
                next_period_end: add_days(next_period_start, spec.duration_days),
                topup_ads: spec.total_ads,
                topup_monthly_limit: spec.max_ads_per_month,
            },
        })
    }

    /// Administrative repair: restore the catalog quota values for the
    /// record's tier (balance and monthly cap), leaving usage untouched.
    pub async fn repair_quota(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<QuotaSnapshot> {
        let record = self.load_record(user_id).await?;
        let spec = record.plan_name.spec();

        let patch = PlanPatch::default()
            .total_ads(spec.total_ads)
            .max_ads_per_month(spec.max_ads_per_month)
            .updated_at(now);
        self.plans.apply(user_id, patch).await?;

        let quota = QuotaSnapshot {
            ads_used: record.ads_used,
            total_ads: spec.total_ads,
            max_ads_per_month: spec.max_ads_per_month,
        };

        if let Err(e) = self
            .mirror
            .merge_subscription(user_id, crate::store::MirrorPatch::quota(quota, now))
            .await
        {
            warn!(user_id = %user_id, error = %e, "Failed to sync repaired quota to profile");
        }

        info!(
            user_id = %user_id,
            plan = %record.plan_name,
            total_ads = spec.total_ads,
            "Repaired plan quota from catalog"
        );
        Ok(quota)
    }

    /// Explicit administrative reset: delete the plan record and clear the
    /// `subscription.*` projection from the profile.
    pub async fn reset(&self, user_id: &str) -> EngineResult<()> {
        self.plans.delete(user_id).await?;

        if let Err(e) = self.mirror.clear_subscription(user_id).await {
            warn!(user_id = %user_id, error = %e, "Failed to clear subscription projection");
        }

        info!(user_id = %user_id, "Deleted subscription");
        Ok(())
    }

    async fn load_record(&self, user_id: &str) -> EngineResult<PlanRecord> {
        Ok(self
            .plans
            .load(user_id)
            .await?
            .ok_or_else(|| EngineError::not_found(user_id))?
            .record)
    }
}
