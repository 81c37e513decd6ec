//! Scheduled reconciliation of monthly usage.
//!
//! Sweeps all plan records and persists the billing-period rollover where
//! the policy requires one. Writing `last_usage_date = now` alongside the
//! zeroed counter is what makes the sweep idempotent within a month: the
//! next evaluation sees the current month and keeps the counter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::billing::BillingPeriodPolicy;
use crate::error::EngineResult;
use crate::store::{PlanPatch, PlanStore};

/// Records fetched per page during a sweep.
const SWEEP_PAGE_SIZE: u32 = 100;

/// Sweeps plan records and applies the monthly rollover.
pub struct ReconciliationJob {
    plans: Arc<dyn PlanStore>,
}

impl ReconciliationJob {
    pub fn new(plans: Arc<dyn PlanStore>) -> Self {
        Self { plans }
    }

    /// Reset monthly usage on every record the policy flags.
    ///
    /// Unparseable `last_usage_date` values are flagged too (the policy's
    /// fail-safe), which also repairs the field with a well-formed instant.
    /// A failed write on one record is logged and the sweep continues.
    /// Returns the number of records reset.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let mut reset_count = 0u64;
        let mut page_token = None;

        loop {
            let (records, next) = self.plans.list_page(SWEEP_PAGE_SIZE, page_token).await?;

            for record in records {
                let rollover = BillingPeriodPolicy::evaluate(record.last_usage_date.as_deref(), now);
                if !rollover.requires_reset() {
                    continue;
                }

                match self.reset_usage(&record.user_id, now).await {
                    Ok(()) => {
                        reset_count += 1;
                        info!(user_id = %record.user_id, ?rollover, "Reset monthly usage");
                    }
                    Err(e) => {
                        warn!(user_id = %record.user_id, error = %e, "Failed to reset monthly usage");
                    }
                }
            }

            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!(reset_count, "Reconciliation sweep complete");
        Ok(reset_count)
    }

    /// Reset one user's monthly usage unconditionally (administrative).
    pub async fn reset_usage(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let patch = PlanPatch::default()
            .ads_used(0)
            .last_usage_date(now)
            .updated_at(now);
        self.plans.apply(user_id, patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStores;
    use adscope_models::{NewSubscription, PlanRecord, PlanTier};
    use chrono::TimeZone;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn seeded_record(user_id: &str, ads_used: u32, last_usage: Option<&str>) -> PlanRecord {
        let mut record = PlanRecord::activate(
            &NewSubscription::new(user_id, PlanTier::Lite),
            instant(2024, 1, 1),
        );
        record.ads_used = ads_used;
        record.last_usage_date = last_usage.map(String::from);
        record
    }

    #[tokio::test]
    async fn test_sweep_resets_only_stale_records() {
        let stores = Arc::new(MemoryStores::new());
        let now = instant(2024, 2, 5);

        stores.seed_plan(seeded_record("stale", 3, Some("2024-01-20T10:00:00Z")));
        stores.seed_plan(seeded_record("fresh", 2, Some("2024-02-02T10:00:00Z")));
        stores.seed_plan(seeded_record("unused", 0, None));

        let job = ReconciliationJob::new(stores.clone());
        let reset = job.sweep(now).await.unwrap();

        assert_eq!(reset, 1);
        let stale = stores.plan_snapshot("stale").unwrap();
        assert_eq!(stale.ads_used, 0);
        assert_eq!(stale.last_usage_date, Some(now.to_rfc3339()));
        assert_eq!(stores.plan_snapshot("fresh").unwrap().ads_used, 2);
        assert_eq!(stores.plan_snapshot("unused").unwrap().last_usage_date, None);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_within_a_month() {
        let stores = Arc::new(MemoryStores::new());
        let now = instant(2024, 2, 5);
        stores.seed_plan(seeded_record("u1", 4, Some("2024-01-31T23:00:00Z")));

        let job = ReconciliationJob::new(stores.clone());
        assert_eq!(job.sweep(now).await.unwrap(), 1);
        assert_eq!(job.sweep(now).await.unwrap(), 0);
        assert_eq!(job.sweep(instant(2024, 2, 20)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_repairs_malformed_usage_dates() {
        let stores = Arc::new(MemoryStores::new());
        let now = instant(2024, 2, 5);
        stores.seed_plan(seeded_record("broken", 3, Some("garbage")));

        let job = ReconciliationJob::new(stores.clone());
        assert_eq!(job.sweep(now).await.unwrap(), 1);

        let repaired = stores.plan_snapshot("broken").unwrap();
        assert_eq!(repaired.ads_used, 0);
        assert_eq!(repaired.last_usage_date, Some(now.to_rfc3339()));

        // Repaired records are no-ops on the next run
        assert_eq!(job.sweep(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_pages_through_many_records() {
        let stores = Arc::new(MemoryStores::new());
        let now = instant(2024, 2, 5);
        for i in 0..250 {
            stores.seed_plan(seeded_record(
                &format!("user-{:03}", i),
                1,
                Some("2024-01-15T10:00:00Z"),
            ));
        }

        let job = ReconciliationJob::new(stores.clone());
        assert_eq!(job.sweep(now).await.unwrap(), 250);
    }
}
