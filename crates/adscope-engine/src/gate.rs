//! The consumption gate: two-phase validation and commit of one analysis
//! unit.
//!
//! `try_consume` runs before the external analysis call and only validates;
//! `commit` runs after the call reported a usable result and persists the
//! decrement. The external call is slow (order of minutes) and no lock or
//! transaction is held across it — by design. Two concurrent requests for
//! the same user can therefore both pass validation against the same
//! balance, transiently over-granting the caps by at most
//! (concurrency-degree − 1) units. The commit narrows that window with an
//! optimistic revision check: when the record no longer permits the charge,
//! it fails with `ConcurrentModification` and the already-performed
//! analysis stays unbilled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use adscope_models::{AnalysisVerdict, PlanTier, QuotaSnapshot};

use crate::billing::{BillingPeriodPolicy, Rollover};
use crate::error::{EngineError, EngineResult};
use crate::projection::spawn_quota_sync;
use crate::store::{PlanPatch, PlanStore, ProfileMirrorStore};

/// Maximum attempts to land the commit under concurrent writers.
const MAX_COMMIT_RETRIES: u32 = 5;

/// Base delay for exponential backoff between commit attempts (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Authorization to consume one analysis unit, issued by `try_consume`.
///
/// Carries the effective quota numbers observed at validation time. Nothing
/// is persisted until `commit`; a ticket that is dropped (failed analysis,
/// crashed request) costs the user nothing.
#[derive(Debug, Clone)]
pub struct ConsumptionTicket {
    user_id: String,
    /// Effective monthly usage at issue time (post-rollover).
    pub ads_used: u32,
    /// Remaining balance at issue time.
    pub total_ads: u32,
    /// Monthly cap at issue time.
    pub max_ads_per_month: u32,
    /// Plan tier at issue time.
    pub plan_name: PlanTier,
    /// Rollover decision applied when computing `ads_used`.
    pub rollover: Rollover,
    /// When the ticket was issued.
    pub issued_at: DateTime<Utc>,
}

impl ConsumptionTicket {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Result of a committed consumption.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    /// Quota numbers after the decrement.
    pub quota: QuotaSnapshot,
    pub plan_name: PlanTier,
    pub committed_at: DateTime<Utc>,
}

/// Transactional decision point around the external analysis call.
pub struct ConsumptionGate {
    plans: Arc<dyn PlanStore>,
    mirror: Arc<dyn ProfileMirrorStore>,
}

impl ConsumptionGate {
    pub fn new(plans: Arc<dyn PlanStore>, mirror: Arc<dyn ProfileMirrorStore>) -> Self {
        Self { plans, mirror }
    }

    /// Validate that one unit may be consumed, without mutating storage.
    ///
    /// Applies the billing-period policy in memory, then checks the monthly
    /// cap and the remaining balance. Fails with `NotFound`,
    /// `MonthlyLimitExceeded`, or `BalanceExhausted`.
    pub async fn try_consume(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ConsumptionTicket> {
        let versioned = self
            .plans
            .load(user_id)
            .await?
            .ok_or_else(|| EngineError::not_found(user_id))?;
        let record = versioned.record;

        let (effective_used, rollover) = BillingPeriodPolicy::effective_ads_used(&record, now);

        if effective_used >= record.max_ads_per_month {
            return Err(EngineError::MonthlyLimitExceeded {
                used: effective_used,
                limit: record.max_ads_per_month,
            });
        }
        if record.total_ads == 0 {
            return Err(EngineError::BalanceExhausted);
        }

        debug!(
            user_id = %user_id,
            ads_used = effective_used,
            max_ads_per_month = record.max_ads_per_month,
            total_ads = record.total_ads,
            ?rollover,
            "Issued consumption ticket"
        );

        Ok(ConsumptionTicket {
            user_id: user_id.to_string(),
            ads_used: effective_used,
            total_ads: record.total_ads,
            max_ads_per_month: record.max_ads_per_month,
            plan_name: record.plan_name,
            rollover,
            issued_at: now,
        })
    }

    /// Settle a ticket against the analysis verdict.
    ///
    /// Commits iff the analysis produced at least one usable result; a
    /// fully-failed analysis returns `AnalysisFailed` and leaves the record
    /// untouched. A billable-but-degraded outcome (under half the attempted
    /// features succeeded) is still charged, with a warning.
    pub async fn settle(
        &self,
        ticket: ConsumptionTicket,
        verdict: &AnalysisVerdict,
        now: DateTime<Utc>,
    ) -> EngineResult<CommitReceipt> {
        if !verdict.is_billable() {
            info!(
                user_id = %ticket.user_id,
                attempted = verdict.attempted,
                "Analysis produced no usable result; entitlement left untouched"
            );
            return Err(EngineError::AnalysisFailed);
        }

        if verdict.is_degraded() {
            warn!(
                user_id = %ticket.user_id,
                succeeded = verdict.succeeded,
                attempted = verdict.attempted,
                "Low analysis success rate; charging anyway"
            );
        }

        self.commit(ticket, now).await
    }

    /// Persist exactly one unit of consumption.
    ///
    /// Re-reads the record, re-derives the effective usage for `now`, and
    /// writes `ads_used`, `total_ads`, `last_usage_date`, and `updated_at`
    /// as a per-field update guarded by the record revision. A revision
    /// conflict retries with backoff; a record that no longer permits the
    /// charge fails with `ConcurrentModification`.
    pub async fn commit(
        &self,
        ticket: ConsumptionTicket,
        now: DateTime<Utc>,
    ) -> EngineResult<CommitReceipt> {
        let user_id = ticket.user_id.clone();

        for attempt in 0..MAX_COMMIT_RETRIES {
            let versioned = self
                .plans
                .load(&user_id)
                .await?
                .ok_or_else(|| EngineError::not_found(&user_id))?;
            let record = versioned.record;

            let (effective_used, _) = BillingPeriodPolicy::effective_ads_used(&record, now);

            // The ticket was valid when issued; if the record no longer
            // permits the charge, a concurrent consumer won the race.
            if effective_used >= record.max_ads_per_month || record.total_ads == 0 {
                warn!(
                    user_id = %user_id,
                    ads_used = effective_used,
                    total_ads = record.total_ads,
                    "Plan no longer permits the charge; analysis stays unbilled"
                );
                return Err(EngineError::ConcurrentModification);
            }

            let new_ads_used = effective_used + 1;
            let new_total_ads = record.total_ads - 1;
            let patch = PlanPatch::default()
                .ads_used(new_ads_used)
                .total_ads(new_total_ads)
                .last_usage_date(now)
                .updated_at(now);

            let write = match &versioned.revision {
                Some(revision) => {
                    self.plans
                        .apply_if_unchanged(&user_id, patch, revision)
                        .await
                }
                // Backend without revisions: plain per-field update
                None => self.plans.apply(&user_id, patch).await,
            };

            match write {
                Ok(()) => {
                    let quota = QuotaSnapshot {
                        ads_used: new_ads_used,
                        total_ads: new_total_ads,
                        max_ads_per_month: record.max_ads_per_month,
                    };

                    info!(
                        user_id = %user_id,
                        ads_used = new_ads_used,
                        total_ads = new_total_ads,
                        "Committed consumption"
                    );

                    spawn_quota_sync(Arc::clone(&self.mirror), user_id, quota, now);

                    return Ok(CommitReceipt {
                        quota,
                        plan_name: record.plan_name,
                        committed_at: now,
                    });
                }
                Err(EngineError::ConcurrentModification) => {
                    debug!(
                        user_id = %user_id,
                        attempt = attempt + 1,
                        "Commit revision conflict, retrying"
                    );
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS * (attempt as u64 + 1));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            user_id = %user_id,
            retries = MAX_COMMIT_RETRIES,
            "Commit failed after retries due to concurrent updates"
        );
        Err(EngineError::ConcurrentModification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStores, PlanStore};
    use adscope_models::{NewSubscription, PlanRecord};
    use chrono::TimeZone;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn seeded_gate(record: PlanRecord) -> (Arc<MemoryStores>, ConsumptionGate) {
        let stores = Arc::new(MemoryStores::new());
        stores.seed_plan(record);
        let gate = ConsumptionGate::new(stores.clone(), stores.clone());
        (stores, gate)
    }

    fn lite_record(now: DateTime<Utc>) -> PlanRecord {
        PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Lite), now)
    }

    fn billable() -> AnalysisVerdict {
        AnalysisVerdict {
            attempted: 1,
            succeeded: 1,
        }
    }

    #[tokio::test]
    async fn test_try_consume_has_no_side_effects() {
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));
        let before = stores.plan_snapshot("u1").unwrap();

        for _ in 0..3 {
            gate.try_consume("u1", now).await.unwrap();
        }

        assert_eq!(stores.plan_snapshot("u1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_try_consume_unknown_user() {
        let (_, gate) = seeded_gate(lite_record(instant(2024, 3, 1)));
        let result = gate.try_consume("ghost", instant(2024, 3, 1)).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_monthly_limit_rejection_is_side_effect_free() {
        let now = instant(2024, 3, 10);
        let mut record = lite_record(instant(2024, 3, 1));
        record.ads_used = 4; // Lite cap
        record.last_usage_date = Some(instant(2024, 3, 5).to_rfc3339());
        let (stores, gate) = seeded_gate(record.clone());

        let result = gate.try_consume("u1", now).await;
        assert!(matches!(
            result,
            Err(EngineError::MonthlyLimitExceeded { used: 4, limit: 4 })
        ));
        assert_eq!(stores.plan_snapshot("u1").unwrap(), record);
    }

    #[tokio::test]
    async fn test_exhausted_balance_rejection() {
        let now = instant(2024, 3, 1);
        let mut record = lite_record(now);
        record.total_ads = 0;
        let (stores, gate) = seeded_gate(record.clone());

        let result = gate.try_consume("u1", now).await;
        assert!(matches!(result, Err(EngineError::BalanceExhausted)));
        assert_eq!(stores.plan_snapshot("u1").unwrap(), record);
    }

    #[tokio::test]
    async fn test_rollover_grants_a_fresh_month() {
        // Cap reached in January, consuming again in February
        let mut record = lite_record(instant(2024, 1, 5));
        record.ads_used = 4;
        record.last_usage_date = Some(instant(2024, 1, 20).to_rfc3339());
        let (stores, gate) = seeded_gate(record);

        let now = instant(2024, 2, 2);
        let ticket = gate.try_consume("u1", now).await.unwrap();
        assert_eq!(ticket.ads_used, 0);
        assert_eq!(ticket.rollover, Rollover::NewMonth);

        let receipt = gate.commit(ticket, now).await.unwrap();
        assert_eq!(receipt.quota.ads_used, 1);

        let stored = stores.plan_snapshot("u1").unwrap();
        assert_eq!(stored.ads_used, 1);
        assert_eq!(stored.last_usage_date, Some(now.to_rfc3339()));
    }

    #[tokio::test]
    async fn test_commit_decrements_exactly_one_unit() {
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));

        let ticket = gate.try_consume("u1", now).await.unwrap();
        let receipt = gate.commit(ticket, now).await.unwrap();

        assert_eq!(receipt.quota.ads_used, 1);
        assert_eq!(receipt.quota.total_ads, 11);

        let stored = stores.plan_snapshot("u1").unwrap();
        assert_eq!(stored.ads_used, 1);
        assert_eq!(stored.total_ads, 11);
        assert_eq!(stored.updated_at, now);
    }

    #[tokio::test]
    async fn test_settle_refuses_to_bill_a_failed_analysis() {
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));
        let before = stores.plan_snapshot("u1").unwrap();

        let ticket = gate.try_consume("u1", now).await.unwrap();
        let verdict = AnalysisVerdict {
            attempted: 1,
            succeeded: 0,
        };

        let result = gate.settle(ticket, &verdict, now).await;
        assert!(matches!(result, Err(EngineError::AnalysisFailed)));
        assert_eq!(stores.plan_snapshot("u1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_settle_charges_a_degraded_but_billable_analysis() {
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));

        let ticket = gate.try_consume("u1", now).await.unwrap();
        let verdict = AnalysisVerdict {
            attempted: 3,
            succeeded: 1,
        };

        gate.settle(ticket, &verdict, now).await.unwrap();
        assert_eq!(stores.plan_snapshot("u1").unwrap().ads_used, 1);
    }

    #[tokio::test]
    async fn test_commit_fails_when_balance_was_drained_concurrently() {
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));

        let ticket = gate.try_consume("u1", now).await.unwrap();

        // A concurrent consumer drains the balance between phases
        stores
            .apply("u1", PlanPatch::default().total_ads(0))
            .await
            .unwrap();

        let result = gate.commit(ticket, now).await;
        assert!(matches!(result, Err(EngineError::ConcurrentModification)));
        assert_eq!(stores.plan_snapshot("u1").unwrap().total_ads, 0);
    }

    #[tokio::test]
    async fn test_two_tickets_from_one_balance_both_commit_within_caps() {
        // The documented race: both requests validate against the same
        // balance. With room under the caps, both commits land and the
        // counters stay exact.
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));

        let first = gate.try_consume("u1", now).await.unwrap();
        let second = gate.try_consume("u1", now).await.unwrap();
        assert_eq!(first.total_ads, second.total_ads);

        gate.commit(first, now).await.unwrap();
        gate.commit(second, now).await.unwrap();

        let stored = stores.plan_snapshot("u1").unwrap();
        assert_eq!(stored.ads_used, 2);
        assert_eq!(stored.total_ads, 10);
    }

    #[tokio::test]
    async fn test_commit_propagates_quota_to_mirror() {
        let now = instant(2024, 3, 1);
        let (stores, gate) = seeded_gate(lite_record(now));

        let ticket = gate.try_consume("u1", now).await.unwrap();
        gate.commit(ticket, now).await.unwrap();

        // Mirror propagation is spawned; give it a few polls
        let mut mirror = None;
        for _ in 0..50 {
            mirror = stores.mirror_snapshot("u1");
            if mirror.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mirror = mirror.expect("mirror was never synced");
        assert_eq!(mirror.ads_used, Some(1));
        assert_eq!(mirror.ad_quota, Some(11));
        assert_eq!(mirror.max_ads_per_month, Some(4));
    }
}
