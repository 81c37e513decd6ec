//! Firestore-backed implementation of the storage seams.
//!
//! Plan records are encoded field by field (tolerant of missing numerics in
//! legacy documents); archived analyses round-trip through their serde
//! representation.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use adscope_firestore::{
    Document, FieldWrite, FirestoreClient, FirestoreError, ToFirestoreValue, Value,
};
use adscope_firestore::types::{ArrayValue, MapValue};
use adscope_models::{AnalysisRecord, Feature, PlanRecord, PlanTier};
use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};
use crate::store::{
    collections, AnalysisArchive, MirrorPatch, PlanPatch, PlanStore, ProfileMirrorStore,
    VersionedPlan,
};

/// Plan record field names, as stored.
mod fields {
    pub const USER_ID: &str = "userId";
    pub const PLAN_NAME: &str = "planName";
    pub const SUBSCRIPTION_START_DATE: &str = "subscriptionStartDate";
    pub const SUBSCRIPTION_END_DATE: &str = "subscriptionEndDate";
    pub const VALIDITY_DAYS: &str = "validityDays";
    pub const TOTAL_ADS: &str = "totalAds";
    pub const MAX_ADS_PER_MONTH: &str = "maxAdsPerMonth";
    pub const ADS_USED: &str = "adsUsed";
    pub const LAST_USAGE_DATE: &str = "lastUsageDate";
    pub const SELECTED_FEATURES: &str = "selectedFeatures";
    pub const TOTAL_PRICE: &str = "totalPrice";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// Firestore-backed plan store, mirror store, and analysis archive.
#[derive(Clone)]
pub struct FirestoreStores {
    client: FirestoreClient,
}

impl FirestoreStores {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }
}

// =============================================================================
// Plan record encoding
// =============================================================================

fn encode_plan(record: &PlanRecord) -> HashMap<String, Value> {
    let mut fields_map = HashMap::new();
    fields_map.insert(fields::USER_ID.into(), record.user_id.to_firestore_value());
    fields_map.insert(
        fields::PLAN_NAME.into(),
        record.plan_name.as_str().to_firestore_value(),
    );
    fields_map.insert(
        fields::SUBSCRIPTION_START_DATE.into(),
        record.subscription_start_date.to_firestore_value(),
    );
    fields_map.insert(
        fields::SUBSCRIPTION_END_DATE.into(),
        record.subscription_end_date.to_firestore_value(),
    );
    fields_map.insert(
        fields::VALIDITY_DAYS.into(),
        record.validity_days.to_firestore_value(),
    );
    fields_map.insert(fields::TOTAL_ADS.into(), record.total_ads.to_firestore_value());
    fields_map.insert(
        fields::MAX_ADS_PER_MONTH.into(),
        record.max_ads_per_month.to_firestore_value(),
    );
    fields_map.insert(fields::ADS_USED.into(), record.ads_used.to_firestore_value());
    if let Some(last_usage) = &record.last_usage_date {
        fields_map.insert(
            fields::LAST_USAGE_DATE.into(),
            Value::TimestampValue(last_usage.clone()),
        );
    }
    let feature_names: Vec<&str> = record.selected_features.iter().map(|f| f.as_str()).collect();
    fields_map.insert(
        fields::SELECTED_FEATURES.into(),
        feature_names.to_firestore_value(),
    );
    fields_map.insert(
        fields::TOTAL_PRICE.into(),
        record.total_price.to_firestore_value(),
    );
    fields_map.insert(fields::CREATED_AT.into(), record.created_at.to_firestore_value());
    fields_map.insert(fields::UPDATED_AT.into(), record.updated_at.to_firestore_value());
    fields_map
}

fn decode_plan(doc: &Document) -> EngineResult<PlanRecord> {
    let invalid = |msg: String| EngineError::Store(FirestoreError::invalid_response(msg));

    let user_id = doc
        .field::<String>(fields::USER_ID)
        .or_else(|| doc.doc_id().map(String::from))
        .ok_or_else(|| invalid("plan record without a user id".into()))?;

    let plan_raw = doc
        .field::<String>(fields::PLAN_NAME)
        .ok_or_else(|| invalid(format!("plan record {} has no plan name", user_id)))?;
    let plan_name = PlanTier::parse(&plan_raw)
        .ok_or_else(|| invalid(format!("plan record {} has unknown tier {}", user_id, plan_raw)))?;

    let subscription_start_date = doc
        .field::<DateTime<Utc>>(fields::SUBSCRIPTION_START_DATE)
        .ok_or_else(|| invalid(format!("plan record {} has no start date", user_id)))?;
    let subscription_end_date = doc
        .field::<DateTime<Utc>>(fields::SUBSCRIPTION_END_DATE)
        .ok_or_else(|| invalid(format!("plan record {} has no end date", user_id)))?;

    let selected_features = doc
        .field::<Vec<String>>(fields::SELECTED_FEATURES)
        .map(|names| names.iter().filter_map(|n| Feature::parse(n)).collect())
        .unwrap_or_default();

    Ok(PlanRecord {
        user_id,
        plan_name,
        subscription_start_date,
        subscription_end_date,
        validity_days: doc.field::<u32>(fields::VALIDITY_DAYS).unwrap_or(0),
        total_ads: doc.field::<u32>(fields::TOTAL_ADS).unwrap_or(0),
        max_ads_per_month: doc.field::<u32>(fields::MAX_ADS_PER_MONTH).unwrap_or(0),
        ads_used: doc.field::<u32>(fields::ADS_USED).unwrap_or(0),
        last_usage_date: doc.field::<String>(fields::LAST_USAGE_DATE),
        selected_features,
        total_price: doc.field::<f64>(fields::TOTAL_PRICE).unwrap_or(0.0),
        created_at: doc
            .field::<DateTime<Utc>>(fields::CREATED_AT)
            .unwrap_or(subscription_start_date),
        updated_at: doc
            .field::<DateTime<Utc>>(fields::UPDATED_AT)
            .unwrap_or(subscription_start_date),
    })
}

fn patch_writes(patch: &PlanPatch) -> Vec<(String, FieldWrite)> {
    let mut writes = Vec::new();
    if let Some(v) = patch.ads_used {
        writes.push((fields::ADS_USED.to_string(), FieldWrite::set(v)));
    }
    if let Some(v) = patch.total_ads {
        writes.push((fields::TOTAL_ADS.to_string(), FieldWrite::set(v)));
    }
    if let Some(v) = patch.max_ads_per_month {
        writes.push((fields::MAX_ADS_PER_MONTH.to_string(), FieldWrite::set(v)));
    }
    if let Some(v) = patch.last_usage_date {
        writes.push((fields::LAST_USAGE_DATE.to_string(), FieldWrite::set(v)));
    }
    if let Some(v) = patch.updated_at {
        writes.push((fields::UPDATED_AT.to_string(), FieldWrite::set(v)));
    }
    writes
}

#[async_trait]
impl PlanStore for FirestoreStores {
    async fn load(&self, user_id: &str) -> EngineResult<Option<VersionedPlan>> {
        let doc = self
            .client
            .get_document(collections::PLAN_SELECTIONS, user_id)
            .await?;

        match doc {
            Some(doc) => {
                let record = decode_plan(&doc)?;
                Ok(Some(VersionedPlan {
                    record,
                    revision: doc.update_time,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, record: &PlanRecord) -> EngineResult<()> {
        self.client
            .set_document(collections::PLAN_SELECTIONS, &record.user_id, encode_plan(record))
            .await?;
        Ok(())
    }

    async fn apply(&self, user_id: &str, patch: PlanPatch) -> EngineResult<()> {
        self.client
            .update_fields(collections::PLAN_SELECTIONS, user_id, patch_writes(&patch))
            .await
            .map_err(|e| match e {
                FirestoreError::NotFound(_) => EngineError::not_found(user_id),
                other => other.into(),
            })?;
        Ok(())
    }

    async fn apply_if_unchanged(
        &self,
        user_id: &str,
        patch: PlanPatch,
        revision: &str,
    ) -> EngineResult<()> {
        self.client
            .update_fields_with_precondition(
                collections::PLAN_SELECTIONS,
                user_id,
                patch_writes(&patch),
                revision,
            )
            .await
            .map_err(|e| {
                if e.is_precondition_failed() {
                    EngineError::ConcurrentModification
                } else if matches!(e, FirestoreError::NotFound(_)) {
                    EngineError::not_found(user_id)
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> EngineResult<()> {
        self.client
            .delete_document(collections::PLAN_SELECTIONS, user_id)
            .await?;
        Ok(())
    }

    async fn list_page(
        &self,
        page_size: u32,
        page_token: Option<String>,
    ) -> EngineResult<(Vec<PlanRecord>, Option<String>)> {
        let page = self
            .client
            .list_documents(
                collections::PLAN_SELECTIONS,
                Some(page_size),
                page_token.as_deref(),
            )
            .await?;

        let mut records = Vec::new();
        for doc in page.documents.unwrap_or_default() {
            match decode_plan(&doc) {
                Ok(record) => records.push(record),
                // A single corrupt record must not halt a sweep
                Err(e) => warn!(doc_id = ?doc.doc_id(), error = %e, "Skipping undecodable plan record"),
            }
        }

        Ok((records, page.next_page_token))
    }
}

// =============================================================================
// Profile mirror
// =============================================================================

fn mirror_writes(patch: &MirrorPatch) -> (HashMap<String, Value>, Vec<String>) {
    let mut sub = HashMap::new();
    let mut mask = Vec::new();

    macro_rules! put {
        ($name:literal, $value:expr) => {
            sub.insert($name.to_string(), $value);
            mask.push(concat!("subscription.", $name).to_string());
        };
    }

    if let Some(v) = patch.plan_name {
        put!("planName", v.as_str().to_firestore_value());
    }
    if let Some(v) = patch.ad_quota {
        put!("adQuota", v.to_firestore_value());
    }
    if let Some(v) = patch.ads_used {
        put!("adsUsed", v.to_firestore_value());
    }
    if let Some(v) = patch.max_ads_per_month {
        put!("maxAdsPerMonth", v.to_firestore_value());
    }
    if let Some(v) = patch.total_price {
        put!("totalPrice", v.to_firestore_value());
    }
    if let Some(v) = patch.subscription_start_date {
        put!("subscriptionStartDate", v.to_firestore_value());
    }
    if let Some(v) = patch.subscription_end_date {
        put!("subscriptionEndDate", v.to_firestore_value());
    }
    if let Some(v) = patch.validity_days {
        put!("validityDays", v.to_firestore_value());
    }
    if let Some(features) = &patch.selected_features {
        let names: Vec<&str> = features.iter().map(|f| f.as_str()).collect();
        put!("selectedFeatures", names.to_firestore_value());
    }
    if let Some(v) = patch.updated_at {
        put!("updatedAt", v.to_firestore_value());
    }

    let mut fields_map = HashMap::new();
    fields_map.insert(
        "subscription".to_string(),
        Value::MapValue(MapValue { fields: Some(sub) }),
    );
    if let Some(v) = patch.updated_at {
        fields_map.insert("updatedAt".to_string(), v.to_firestore_value());
        mask.push("updatedAt".to_string());
    }

    (fields_map, mask)
}

#[async_trait]
impl ProfileMirrorStore for FirestoreStores {
    async fn merge_subscription(&self, user_id: &str, patch: MirrorPatch) -> EngineResult<()> {
        let (fields_map, mask) = mirror_writes(&patch);
        if mask.is_empty() {
            return Ok(());
        }
        self.client
            .upsert_fields(collections::USER_PROFILES, user_id, fields_map, mask)
            .await?;
        Ok(())
    }

    async fn clear_subscription(&self, user_id: &str) -> EngineResult<()> {
        let result = self
            .client
            .update_fields(
                collections::USER_PROFILES,
                user_id,
                vec![("subscription".to_string(), FieldWrite::Delete)],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // No profile means nothing to clear
            Err(FirestoreError::NotFound(_)) => {
                debug!(user_id = %user_id, "No profile to clear");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Analysis archive
// =============================================================================

/// Convert a JSON value into a Firestore value.
fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::NullValue(()),
        serde_json::Value::Bool(b) => Value::BooleanValue(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::IntegerValue(i.to_string())
            } else {
                Value::DoubleValue(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::StringValue(s.clone()),
        serde_json::Value::Array(items) => Value::ArrayValue(ArrayValue {
            values: Some(items.iter().map(json_to_value).collect()),
        }),
        serde_json::Value::Object(map) => Value::MapValue(MapValue {
            fields: Some(
                map.iter()
                    .map(|(k, v)| (k.clone(), json_to_value(v)))
                    .collect(),
            ),
        }),
    }
}

/// Convert a Firestore value back into JSON.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NullValue(()) => serde_json::Value::Null,
        Value::BooleanValue(b) => serde_json::Value::Bool(*b),
        Value::IntegerValue(s) => s
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        Value::DoubleValue(f) => serde_json::Value::from(*f),
        Value::TimestampValue(s) | Value::StringValue(s) => serde_json::Value::String(s.clone()),
        Value::ArrayValue(arr) => serde_json::Value::Array(
            arr.values
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(value_to_json)
                .collect(),
        ),
        Value::MapValue(map) => serde_json::Value::Object(
            map.fields
                .as_ref()
                .map(|fields| {
                    fields
                        .iter()
                        .map(|(k, v)| (k.clone(), value_to_json(v)))
                        .collect()
                })
                .unwrap_or_default(),
        ),
    }
}

fn encode_analysis(record: &AnalysisRecord) -> EngineResult<HashMap<String, Value>> {
    let json = serde_json::to_value(record).map_err(FirestoreError::Json)?;
    match json {
        serde_json::Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect()),
        _ => Err(EngineError::Store(FirestoreError::invalid_response(
            "analysis record did not serialize to an object",
        ))),
    }
}

fn decode_analysis(doc: &Document) -> EngineResult<AnalysisRecord> {
    let json = serde_json::Value::Object(
        doc.fields
            .as_ref()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), value_to_json(v)))
                    .collect()
            })
            .unwrap_or_default(),
    );
    serde_json::from_value(json).map_err(|e| {
        EngineError::Store(FirestoreError::invalid_response(format!(
            "undecodable analysis record {:?}: {}",
            doc.doc_id(),
            e
        )))
    })
}

#[async_trait]
impl AnalysisArchive for FirestoreStores {
    async fn record(&self, analysis: &AnalysisRecord) -> EngineResult<()> {
        let fields_map = encode_analysis(analysis)?;
        self.client
            .set_document(collections::AD_ANALYSES, &analysis.artifact_id, fields_map)
            .await?;
        Ok(())
    }

    async fn get(&self, artifact_id: &str) -> EngineResult<Option<AnalysisRecord>> {
        let doc = self
            .client
            .get_document(collections::AD_ANALYSES, artifact_id)
            .await?;
        match doc {
            Some(doc) => Ok(Some(decode_analysis(&doc)?)),
            None => Ok(None),
        }
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<AnalysisRecord>> {
        let docs = self
            .client
            .query_equal(
                collections::AD_ANALYSES,
                fields::USER_ID,
                user_id.to_firestore_value(),
                Some(limit),
            )
            .await?;

        let mut records = Vec::with_capacity(docs.len());
        for doc in &docs {
            match decode_analysis(doc) {
                Ok(record) => records.push(record),
                Err(e) => warn!(doc_id = ?doc.doc_id(), error = %e, "Skipping undecodable analysis"),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
