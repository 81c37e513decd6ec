//! The analysis pipeline: the two-phase gate in context.
//!
//! A request flows: validate -> `try_consume` -> store media -> signed URL
//! -> remote analysis -> `settle` -> archive. Everything before settlement
//! can fail without costing the user anything; after a committed
//! settlement the charge stands even if archiving fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use adscope_analysis::{AnalysisClient, AnalysisFields};
use adscope_models::{
    AnalysisContext, AnalysisOutcome, AnalysisRecord, AnalysisVerdict, MediaKind, UsageAtAnalysis,
};
use adscope_storage::{media_key, MediaStorage};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::gate::ConsumptionGate;
use crate::store::{AnalysisArchive, PlanStore, ProfileMirrorStore};

/// Signed media URLs stay valid for a week.
const SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default page size for history reads.
const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Blob-store seam used by the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn store(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> EngineResult<()>;

    async fn signed_url(&self, key: &str, ttl: Duration) -> EngineResult<String>;
}

#[async_trait]
impl MediaSink for MediaStorage {
    async fn store(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> EngineResult<()> {
        self.upload_bytes(bytes, key, content_type).await?;
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> EngineResult<String> {
        Ok(self.presign_get(key, ttl).await?)
    }
}

/// Remote-analysis seam used by the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        media: Vec<u8>,
        filename: &str,
        content_type: &str,
        fields: &AnalysisFields,
    ) -> AnalysisOutcome;
}

#[async_trait]
impl AdAnalyzer for AnalysisClient {
    async fn analyze(
        &self,
        media: Vec<u8>,
        filename: &str,
        content_type: &str,
        fields: &AnalysisFields,
    ) -> AnalysisOutcome {
        AnalysisClient::analyze(self, media, filename, content_type, fields).await
    }
}

/// An analysis request, with the brand context already resolved by the
/// caller.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub context: AnalysisContext,
    pub media: Vec<u8>,
    pub filename: String,
    pub content_type: String,
    pub brand_colors: String,
    pub tone_of_voice: String,
    pub logo_url: Option<String>,
}

/// What the caller gets back from a billed analysis.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub artifact_id: String,
    pub media_url: String,
    pub verdict: AnalysisVerdict,
    pub results: AnalysisOutcome,
    pub usage: UsageAtAnalysis,
}

/// Orchestrates one ad analysis end to end.
pub struct AdAnalysisService {
    gate: ConsumptionGate,
    media: Arc<dyn MediaSink>,
    analyzer: Arc<dyn AdAnalyzer>,
    archive: Arc<dyn AnalysisArchive>,
    clock: Arc<dyn Clock>,
}

impl AdAnalysisService {
    pub fn new(
        plans: Arc<dyn PlanStore>,
        mirror: Arc<dyn ProfileMirrorStore>,
        media: Arc<dyn MediaSink>,
        analyzer: Arc<dyn AdAnalyzer>,
        archive: Arc<dyn AnalysisArchive>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate: ConsumptionGate::new(plans, mirror),
            media,
            analyzer,
            archive,
            clock,
        }
    }

    /// Run one analysis, charging exactly one unit on success.
    pub async fn analyze(&self, request: AnalysisRequest) -> EngineResult<AnalysisReport> {
        request.context.validate()?;
        if request.media.is_empty() {
            return Err(EngineError::invalid_request("media file is required"));
        }
        let media_kind = MediaKind::from_content_type(&request.content_type).ok_or_else(|| {
            EngineError::invalid_request(format!(
                "unsupported media type: {}",
                request.content_type
            ))
        })?;

        let user_id = request.context.user_id.clone();
        let now = self.clock.now();
        let ticket = self.gate.try_consume(&user_id, now).await?;

        let artifact_id = Uuid::new_v4().to_string();
        let storage_key = media_key(
            &user_id,
            &request.context.brand_id,
            media_kind.as_str(),
            &artifact_id,
            &request.filename,
        );

        self.media
            .store(&storage_key, request.media.clone(), &request.content_type)
            .await?;
        let media_url = self.media.signed_url(&storage_key, SIGNED_URL_TTL).await?;

        let fields = AnalysisFields {
            ad_description: request.context.message_intent.clone(),
            ad_type: request.context.funnel_stage.clone(),
            brand_colors: request.brand_colors.clone(),
            tone_of_voice: request.tone_of_voice.clone(),
            channels: request.context.channels.clone(),
            logo_url: request.logo_url.clone(),
        };

        let outcome = self
            .analyzer
            .analyze(
                request.media,
                &request.filename,
                &request.content_type,
                &fields,
            )
            .await;
        let verdict = outcome.verdict();

        // The remote call can run for minutes; re-read the clock for the
        // commit instant.
        let now = self.clock.now();
        let receipt = self.gate.settle(ticket, &verdict, now).await?;

        let usage = UsageAtAnalysis {
            ads_used: receipt.quota.ads_used,
            max_ads_per_month: receipt.quota.max_ads_per_month,
            total_ads_remaining: receipt.quota.total_ads,
            plan_name: receipt.plan_name,
        };

        let record = AnalysisRecord::from_outcome(
            &artifact_id,
            &request.context,
            &media_url,
            &request.content_type,
            media_kind,
            &storage_key,
            &outcome,
            usage.clone(),
            now,
        );
        // The consumption is already committed; a failed archive write must
        // not take the result away from the caller.
        if let Err(e) = self.archive.record(&record).await {
            warn!(artifact_id = %artifact_id, error = %e, "Failed to archive analysis record");
        }

        info!(
            user_id = %user_id,
            artifact_id = %artifact_id,
            succeeded = verdict.succeeded,
            attempted = verdict.attempted,
            "Analysis completed"
        );

        Ok(AnalysisReport {
            artifact_id,
            media_url,
            verdict,
            results: outcome,
            usage,
        })
    }

    /// A user's archived analyses, most recent first.
    pub async fn history(
        &self,
        user_id: &str,
        limit: Option<u32>,
    ) -> EngineResult<Vec<AnalysisRecord>> {
        self.archive
            .list_for_user(user_id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
            .await
    }

    /// One archived analysis by artifact id.
    pub async fn get_analysis(&self, artifact_id: &str) -> EngineResult<Option<AnalysisRecord>> {
        self.archive.get(artifact_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStores;
    use adscope_models::{FeatureResult, NewSubscription, PlanRecord, PlanTier};
    use adscope_storage::StorageError;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn instant(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).unwrap()
    }

    fn request(user_id: &str) -> AnalysisRequest {
        AnalysisRequest {
            context: AnalysisContext {
                user_id: user_id.to_string(),
                brand_id: "b1".to_string(),
                ad_title: "Spring sale".to_string(),
                message_intent: "promo".to_string(),
                funnel_stage: "awareness".to_string(),
                channels: vec!["facebook".to_string()],
                source: "web".to_string(),
                client_id: "c1".to_string(),
            },
            media: vec![1, 2, 3],
            filename: "ad.png".to_string(),
            content_type: "image/png".to_string(),
            brand_colors: "#112233".to_string(),
            tone_of_voice: "playful".to_string(),
            logo_url: None,
        }
    }

    fn happy_media() -> MockMediaSink {
        let mut media = MockMediaSink::new();
        media.expect_store().returning(|_, _, _| Ok(()));
        media
            .expect_signed_url()
            .returning(|key, _| Ok(format!("https://signed.example/{}", key)));
        media
    }

    fn analyzer_returning(success: bool) -> MockAdAnalyzer {
        let mut analyzer = MockAdAnalyzer::new();
        analyzer.expect_analyze().returning(move |_, _, _, _| {
            let mut outcome = AnalysisOutcome::default();
            let result = if success {
                FeatureResult::ok(json!({"score": 0.9}))
            } else {
                FeatureResult::failed("model crashed")
            };
            outcome.insert("comprehensive_analysis", result);
            outcome
        });
        analyzer
    }

    fn service(
        stores: &Arc<MemoryStores>,
        media: MockMediaSink,
        analyzer: MockAdAnalyzer,
        now: DateTime<Utc>,
    ) -> AdAnalysisService {
        AdAnalysisService::new(
            stores.clone(),
            stores.clone(),
            Arc::new(media),
            Arc::new(analyzer),
            stores.clone(),
            Arc::new(ManualClock::new(now)),
        )
    }

    fn seeded_stores(now: DateTime<Utc>) -> Arc<MemoryStores> {
        let stores = Arc::new(MemoryStores::new());
        stores.seed_plan(PlanRecord::activate(
            &NewSubscription::new("u1", PlanTier::Lite),
            now,
        ));
        stores
    }

    #[tokio::test]
    async fn test_successful_analysis_charges_one_unit_and_archives() {
        let now = instant(2024, 3, 1);
        let stores = seeded_stores(now);
        let svc = service(&stores, happy_media(), analyzer_returning(true), now);

        let report = svc.analyze(request("u1")).await.unwrap();

        assert!(report.verdict.is_billable());
        assert_eq!(report.usage.ads_used, 1);
        assert_eq!(report.usage.total_ads_remaining, 11);
        assert_eq!(report.usage.plan_name, PlanTier::Lite);
        assert!(report.media_url.contains("u1/b1/image/"));

        let stored = stores.plan_snapshot("u1").unwrap();
        assert_eq!(stored.ads_used, 1);
        assert_eq!(stored.total_ads, 11);

        assert_eq!(stores.analysis_count(), 1);
        let archived = svc.history("u1", None).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].artifact_id, report.artifact_id);
        assert_eq!(
            svc.get_analysis(&report.artifact_id).await.unwrap().unwrap().user_id,
            "u1"
        );
    }

    #[tokio::test]
    async fn test_failed_analysis_is_never_charged() {
        let now = instant(2024, 3, 1);
        let stores = seeded_stores(now);
        let before = stores.plan_snapshot("u1").unwrap();
        let svc = service(&stores, happy_media(), analyzer_returning(false), now);

        let result = svc.analyze(request("u1")).await;

        assert!(matches!(result, Err(EngineError::AnalysisFailed)));
        assert_eq!(stores.plan_snapshot("u1").unwrap(), before);
        assert_eq!(stores.analysis_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_media_type_fails_before_any_charge() {
        let now = instant(2024, 3, 1);
        let stores = seeded_stores(now);
        let svc = service(&stores, MockMediaSink::new(), MockAdAnalyzer::new(), now);

        let mut bad = request("u1");
        bad.content_type = "application/pdf".to_string();

        let result = svc.analyze(bad).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
        assert_eq!(stores.plan_snapshot("u1").unwrap().ads_used, 0);
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_without_charging() {
        let now = instant(2024, 3, 1);
        let stores = seeded_stores(now);

        let mut media = MockMediaSink::new();
        media
            .expect_store()
            .returning(|_, _, _| Err(EngineError::Media(StorageError::upload_failed("disk full"))));

        let svc = service(&stores, media, MockAdAnalyzer::new(), now);
        let result = svc.analyze(request("u1")).await;

        assert!(matches!(result, Err(EngineError::Media(_))));
        assert_eq!(stores.plan_snapshot("u1").unwrap().ads_used, 0);
    }

    #[tokio::test]
    async fn test_quota_rejection_skips_upload_and_analysis() {
        let now = instant(2024, 3, 1);
        let stores = Arc::new(MemoryStores::new());
        let mut record =
            PlanRecord::activate(&NewSubscription::new("u1", PlanTier::Lite), now);
        record.total_ads = 0;
        stores.seed_plan(record);

        // Mocks with no expectations: any call would panic the test
        let svc = service(&stores, MockMediaSink::new(), MockAdAnalyzer::new(), now);

        let result = svc.analyze(request("u1")).await;
        assert!(matches!(result, Err(EngineError::BalanceExhausted)));
    }
}
