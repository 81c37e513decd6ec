//! Profile-mirror propagation and repair.
//!
//! The authoritative store is the plan record; the `subscription.*` map on
//! the user profile is a best-effort projection for read surfaces.
//! Propagation never gates a request: commit-path writes are spawned and
//! bounded by a timeout, mutation-path writes are awaited but swallowed.
//! Drift is expected and repaired by [`ProjectionSync`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use adscope_models::{PlanRecord, QuotaSnapshot};

use crate::error::{EngineError, EngineResult};
use crate::store::{MirrorPatch, PlanStore, ProfileMirrorStore};

/// Upper bound on a background mirror write.
const MIRROR_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Propagate quota fields to the mirror without blocking the caller.
///
/// Spawned fire-and-forget; failures are logged and never surfaced, since
/// the mirror is non-authoritative.
pub(crate) fn spawn_quota_sync(
    mirror: Arc<dyn ProfileMirrorStore>,
    user_id: String,
    quota: QuotaSnapshot,
    now: DateTime<Utc>,
) {
    tokio::spawn(async move {
        let patch = MirrorPatch::quota(quota, now);
        match tokio::time::timeout(MIRROR_SYNC_TIMEOUT, mirror.merge_subscription(&user_id, patch))
            .await
        {
            Ok(Ok(())) => {
                debug!(user_id = %user_id, "Synced quota to profile mirror");
            }
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "Failed to sync quota to profile mirror");
            }
            Err(_) => {
                warn!(
                    user_id = %user_id,
                    timeout_secs = MIRROR_SYNC_TIMEOUT.as_secs(),
                    "Profile mirror sync timed out"
                );
            }
        }
    });
}

/// Merge the full projection of a record, swallowing failures.
///
/// Used at the end of plan mutations: the mutation already succeeded, so a
/// mirror failure must not fail the request.
pub(crate) async fn merge_full_projection(
    mirror: &Arc<dyn ProfileMirrorStore>,
    record: &PlanRecord,
    now: DateTime<Utc>,
) {
    if let Err(e) = mirror
        .merge_subscription(&record.user_id, MirrorPatch::full(record, now))
        .await
    {
        warn!(
            user_id = %record.user_id,
            error = %e,
            "Failed to sync subscription projection to profile"
        );
    }
}

/// Explicit projection repair: rebuild the mirror from the plan record.
///
/// Unlike the inline propagation paths this surfaces failures, because a
/// repair job wants to know it did not repair anything.
pub struct ProjectionSync {
    plans: Arc<dyn PlanStore>,
    mirror: Arc<dyn ProfileMirrorStore>,
}

impl ProjectionSync {
    pub fn new(plans: Arc<dyn PlanStore>, mirror: Arc<dyn ProfileMirrorStore>) -> Self {
        Self { plans, mirror }
    }

    /// Rebuild the `subscription.*` projection for one user.
    ///
    /// Returns the quota snapshot that was projected.
    pub async fn sync_projection(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<QuotaSnapshot> {
        let versioned = self
            .plans
            .load(user_id)
            .await?
            .ok_or_else(|| EngineError::not_found(user_id))?;
        let record = versioned.record;

        self.mirror
            .merge_subscription(user_id, MirrorPatch::full(&record, now))
            .await?;

        debug!(user_id = %user_id, "Rebuilt subscription projection");
        Ok(record.quota())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStores;
    use adscope_models::{NewSubscription, PlanTier};
    use chrono::TimeZone;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_sync_projection_rebuilds_mirror_from_plan() {
        let stores = Arc::new(MemoryStores::new());
        let now = instant(2024, 3, 1);
        let mut record = PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Plus), now);
        record.ads_used = 2;
        record.total_ads = 28;
        stores.seed_plan(record);

        let sync = ProjectionSync::new(stores.clone(), stores.clone());
        let quota = sync.sync_projection("u1", instant(2024, 3, 5)).await.unwrap();

        assert_eq!(quota.ads_used, 2);
        assert_eq!(quota.total_ads, 28);

        let mirror = stores.mirror_snapshot("u1").unwrap();
        assert_eq!(mirror.ad_quota, Some(28));
        assert_eq!(mirror.plan_name, Some(PlanTier::Plus));
    }

    #[tokio::test]
    async fn test_sync_projection_without_plan_is_not_found() {
        let stores = Arc::new(MemoryStores::new());
        let sync = ProjectionSync::new(stores.clone(), stores.clone());

        let result = sync.sync_projection("ghost", instant(2024, 3, 1)).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
