//! In-memory implementation of the storage seams.
//!
//! Backs the engine's tests and local development. Revisions are a
//! monotonically increasing counter per record, which makes the
//! optimistic-concurrency path exercisable without a document store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use adscope_models::{AnalysisRecord, PlanRecord};

use crate::error::{EngineError, EngineResult};
use crate::store::{
    AnalysisArchive, MirrorPatch, PlanPatch, PlanStore, ProfileMirrorStore, VersionedPlan,
};

struct StoredPlan {
    record: PlanRecord,
    revision: u64,
}

/// In-memory plan store, mirror store, and analysis archive.
#[derive(Default)]
pub struct MemoryStores {
    plans: Mutex<HashMap<String, StoredPlan>>,
    mirrors: Mutex<HashMap<String, Option<MirrorPatch>>>,
    analyses: Mutex<HashMap<String, AnalysisRecord>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a plan record (test setup).
    pub fn seed_plan(&self, record: PlanRecord) {
        self.plans.lock().unwrap().insert(
            record.user_id.clone(),
            StoredPlan {
                record,
                revision: 1,
            },
        );
    }

    /// Current state of a plan record, if any.
    pub fn plan_snapshot(&self, user_id: &str) -> Option<PlanRecord> {
        self.plans
            .lock()
            .unwrap()
            .get(user_id)
            .map(|stored| stored.record.clone())
    }

    /// Accumulated mirror projection for a user, if any.
    pub fn mirror_snapshot(&self, user_id: &str) -> Option<MirrorPatch> {
        self.mirrors
            .lock()
            .unwrap()
            .get(user_id)
            .and_then(|state| state.clone())
    }

    /// Number of archived analyses.
    pub fn analysis_count(&self) -> usize {
        self.analyses.lock().unwrap().len()
    }
}

#[async_trait]
impl PlanStore for MemoryStores {
    async fn load(&self, user_id: &str) -> EngineResult<Option<VersionedPlan>> {
        Ok(self.plans.lock().unwrap().get(user_id).map(|stored| {
            VersionedPlan {
                record: stored.record.clone(),
                revision: Some(stored.revision.to_string()),
            }
        }))
    }

    async fn save(&self, record: &PlanRecord) -> EngineResult<()> {
        let mut plans = self.plans.lock().unwrap();
        let revision = plans
            .get(&record.user_id)
            .map(|stored| stored.revision + 1)
            .unwrap_or(1);
        plans.insert(
            record.user_id.clone(),
            StoredPlan {
                record: record.clone(),
                revision,
            },
        );
        Ok(())
    }

    async fn apply(&self, user_id: &str, patch: PlanPatch) -> EngineResult<()> {
        let mut plans = self.plans.lock().unwrap();
        let stored = plans
            .get_mut(user_id)
            .ok_or_else(|| EngineError::not_found(user_id))?;
        patch.apply_to(&mut stored.record);
        stored.revision += 1;
        Ok(())
    }

    async fn apply_if_unchanged(
        &self,
        user_id: &str,
        patch: PlanPatch,
        revision: &str,
    ) -> EngineResult<()> {
        let mut plans = self.plans.lock().unwrap();
        let stored = plans
            .get_mut(user_id)
            .ok_or_else(|| EngineError::not_found(user_id))?;
        if stored.revision.to_string() != revision {
            return Err(EngineError::ConcurrentModification);
        }
        patch.apply_to(&mut stored.record);
        stored.revision += 1;
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> EngineResult<()> {
        self.plans.lock().unwrap().remove(user_id);
        Ok(())
    }

    async fn list_page(
        &self,
        page_size: u32,
        page_token: Option<String>,
    ) -> EngineResult<(Vec<PlanRecord>, Option<String>)> {
        let plans = self.plans.lock().unwrap();
        let mut user_ids: Vec<&String> = plans.keys().collect();
        user_ids.sort();

        let offset: usize = page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let page: Vec<PlanRecord> = user_ids
            .iter()
            .skip(offset)
            .take(page_size as usize)
            .map(|id| plans[*id].record.clone())
            .collect();

        let next = if offset + page.len() < user_ids.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok((page, next))
    }
}

#[async_trait]
impl ProfileMirrorStore for MemoryStores {
    async fn merge_subscription(&self, user_id: &str, patch: MirrorPatch) -> EngineResult<()> {
        let mut mirrors = self.mirrors.lock().unwrap();
        let state = mirrors.entry(user_id.to_string()).or_insert(None);
        match state {
            Some(existing) => existing.merge_from(patch),
            None => *state = Some(patch),
        }
        Ok(())
    }

    async fn clear_subscription(&self, user_id: &str) -> EngineResult<()> {
        self.mirrors
            .lock()
            .unwrap()
            .insert(user_id.to_string(), None);
        Ok(())
    }
}

#[async_trait]
impl AnalysisArchive for MemoryStores {
    async fn record(&self, analysis: &AnalysisRecord) -> EngineResult<()> {
        self.analyses
            .lock()
            .unwrap()
            .insert(analysis.artifact_id.clone(), analysis.clone());
        Ok(())
    }

    async fn get(&self, artifact_id: &str) -> EngineResult<Option<AnalysisRecord>> {
        Ok(self.analyses.lock().unwrap().get(artifact_id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<AnalysisRecord>> {
        let analyses = self.analyses.lock().unwrap();
        let mut records: Vec<AnalysisRecord> = analyses
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adscope_models::{NewSubscription, PlanTier};
    use chrono::{TimeZone, Utc};

    fn record(user_id: &str) -> PlanRecord {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        PlanRecord::activate(&NewSubscription::new(user_id, PlanTier::Lite), now)
    }

    #[tokio::test]
    async fn test_apply_bumps_revision() {
        let stores = MemoryStores::new();
        stores.seed_plan(record("u1"));

        let before = stores.load("u1").await.unwrap().unwrap().revision.unwrap();
        stores
            .apply("u1", PlanPatch::default().ads_used(1))
            .await
            .unwrap();
        let after = stores.load("u1").await.unwrap().unwrap().revision.unwrap();

        assert_ne!(before, after);
        assert_eq!(stores.plan_snapshot("u1").unwrap().ads_used, 1);
    }

    #[tokio::test]
    async fn test_apply_if_unchanged_detects_stale_revision() {
        let stores = MemoryStores::new();
        stores.seed_plan(record("u1"));

        let revision = stores.load("u1").await.unwrap().unwrap().revision.unwrap();
        stores
            .apply("u1", PlanPatch::default().ads_used(1))
            .await
            .unwrap();

        let result = stores
            .apply_if_unchanged("u1", PlanPatch::default().ads_used(2), &revision)
            .await;
        assert!(matches!(result, Err(EngineError::ConcurrentModification)));
    }

    #[tokio::test]
    async fn test_list_page_walks_all_records() {
        let stores = MemoryStores::new();
        for i in 0..5 {
            stores.seed_plan(record(&format!("u{}", i)));
        }

        let mut seen = 0;
        let mut token = None;
        loop {
            let (page, next) = stores.list_page(2, token).await.unwrap();
            seen += page.len();
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen, 5);
    }
}
