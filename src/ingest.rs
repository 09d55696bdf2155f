use crate::classifier::NeighborhoodClassifier;
use crate::config::IngestConfig;
use crate::criteria::{BuyBox, BuyBoxCriteria, CriteriaError};
use crate::listing::{DedupKey, Listing, Normalized, normalize_value};
use crate::matching::{Disposition, FilterStage, MatchPipeline, RejectReason};
use crate::merge::{MergeError, MergePreview, Merger};
use crate::store::{PropertyStore, StoreError, UpsertOutcome};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub company_id: Uuid,
    pub buy_box_id: Uuid,
    pub feed: Vec<Value>,
    pub dry_run: bool,
}

/// Failures that abort the whole run instead of a single listing.
#[derive(Debug, Error)]
pub enum FatalRunError {
    #[error("buy box {0} not found")]
    UnknownBuyBox(Uuid),
    #[error(transparent)]
    InvalidCriteria(#[from] CriteriaError),
    #[error("property store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("feed has {count} items; at most {limit} are accepted per run")]
    FeedTooLarge { count: usize, limit: usize },
}

impl FatalRunError {
    pub fn code(&self) -> &'static str {
        match self {
            FatalRunError::UnknownBuyBox(_) => "unknown_buy_box",
            FatalRunError::InvalidCriteria(_) => "invalid_criteria",
            FatalRunError::StoreUnavailable(_) => "store_unavailable",
            FatalRunError::FeedTooLarge { .. } => "feed_too_large",
        }
    }
}

impl From<StoreError> for FatalRunError {
    fn from(value: StoreError) -> Self {
        Self::StoreUnavailable(value.to_string())
    }
}

/// Final state of one feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ListingOutcome {
    Skipped {
        reason: String,
    },
    /// Same dedup key as an earlier item of this feed.
    Coalesced {
        first_index: usize,
    },
    Rejected {
        stage: FilterStage,
        reason: RejectReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Dry runs stop here.
    Admitted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview: Option<MergePreview>,
    },
    Inserted {
        property_id: Uuid,
    },
    Updated {
        property_id: Uuid,
    },
    MergeFailed {
        error: String,
    },
    /// Not processed because the run was cancelled first.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingReport {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<DedupKey>,
    #[serde(flatten)]
    pub outcome: ListingOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    ValidationError,
    MergeFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunItemError {
    pub index: usize,
    pub kind: RunErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub company_id: Uuid,
    pub buy_box_id: Uuid,
    pub dry_run: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub received_count: usize,
    pub skipped_count: usize,
    pub coalesced_count: usize,
    pub admitted_count: usize,
    pub inserted_count: usize,
    pub updated_count: usize,
    pub rejected_by_reason: BTreeMap<String, usize>,
    pub rejected_by_stage: BTreeMap<String, usize>,
    pub errors: Vec<RunItemError>,
    pub listings: Vec<ListingReport>,
}

impl RunSummary {
    pub(crate) fn new(request: &RunRequest) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            company_id: request.company_id,
            buy_box_id: request.buy_box_id,
            dry_run: request.dry_run,
            cancelled: false,
            started_at: now,
            finished_at: now,
            received_count: request.feed.len(),
            skipped_count: 0,
            coalesced_count: 0,
            admitted_count: 0,
            inserted_count: 0,
            updated_count: 0,
            rejected_by_reason: BTreeMap::new(),
            rejected_by_stage: BTreeMap::new(),
            errors: Vec::new(),
            listings: Vec::new(),
        }
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected_by_stage.values().sum()
    }

    fn report(&mut self, index: usize, dedup_key: Option<DedupKey>, outcome: ListingOutcome) {
        match &outcome {
            ListingOutcome::Skipped { reason } => {
                self.skipped_count += 1;
                self.errors.push(RunItemError {
                    index,
                    kind: RunErrorKind::ValidationError,
                    message: reason.clone(),
                });
            }
            ListingOutcome::Coalesced { .. } => self.coalesced_count += 1,
            ListingOutcome::Rejected { stage, reason, .. } => {
                *self
                    .rejected_by_reason
                    .entry(reason.as_str().to_string())
                    .or_default() += 1;
                *self
                    .rejected_by_stage
                    .entry(stage.as_str().to_string())
                    .or_default() += 1;
            }
            ListingOutcome::Admitted { .. } => self.admitted_count += 1,
            ListingOutcome::Inserted { .. } => {
                self.admitted_count += 1;
                self.inserted_count += 1;
            }
            ListingOutcome::Updated { .. } => {
                self.admitted_count += 1;
                self.updated_count += 1;
            }
            ListingOutcome::MergeFailed { error } => {
                self.admitted_count += 1;
                self.errors.push(RunItemError {
                    index,
                    kind: RunErrorKind::MergeFailed,
                    message: error.clone(),
                });
            }
            ListingOutcome::Cancelled => self.cancelled = true,
        }
        self.listings.push(ListingReport {
            index,
            dedup_key,
            outcome,
        });
    }
}

/// Drives normalize -> match -> merge over one feed for one Buy Box.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn PropertyStore>,
    pipeline: MatchPipeline,
    merger: Merger,
    config: Arc<IngestConfig>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        classifier: Arc<dyn NeighborhoodClassifier>,
        config: IngestConfig,
    ) -> Self {
        let pipeline = MatchPipeline::new(classifier, config.classifier_timeout);
        let merger = Merger::new(
            store.clone(),
            config.merge_max_retries,
            config.merge_backoff_base,
        );
        Self {
            store,
            pipeline,
            merger,
            config: Arc::new(config),
        }
    }

    /// Store and classifier chosen from the environment.
    pub async fn from_env() -> Result<Self, StoreError> {
        let config = IngestConfig::from_env();
        let store = crate::store::from_env().await?;
        let classifier = crate::classifier::from_config(&config);
        Ok(Self::new(store, classifier, config))
    }

    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary, FatalRunError> {
        let started = Instant::now();
        if request.feed.len() > self.config.max_feed_items {
            return Err(FatalRunError::FeedTooLarge {
                count: request.feed.len(),
                limit: self.config.max_feed_items,
            });
        }
        let buy_box = self.load_buy_box(request.company_id, request.buy_box_id).await?;
        let mut summary = RunSummary::new(&request);
        info!(
            target = "buybox.ingest",
            run_id = %summary.run_id,
            buy_box_id = %buy_box.id,
            buy_box = buy_box.name.as_deref().unwrap_or("unnamed"),
            items = request.feed.len(),
            dry_run = request.dry_run,
            "ingestion_run_started"
        );

        let mut reports: Vec<(usize, Option<DedupKey>, ListingOutcome)> = Vec::new();
        let mut first_seen: HashMap<DedupKey, usize> = HashMap::new();
        let mut candidates: Vec<(usize, Listing)> = Vec::new();
        for (index, item) in request.feed.into_iter().enumerate() {
            match normalize_value(item) {
                Normalized::Skipped(reason) => {
                    reports.push((
                        index,
                        None,
                        ListingOutcome::Skipped {
                            reason: reason.to_string(),
                        },
                    ));
                }
                Normalized::Listing(listing) => {
                    if let Some(first_index) = first_seen.get(&listing.dedup_key) {
                        reports.push((
                            index,
                            Some(listing.dedup_key.clone()),
                            ListingOutcome::Coalesced {
                                first_index: *first_index,
                            },
                        ));
                    } else {
                        first_seen.insert(listing.dedup_key.clone(), index);
                        candidates.push((index, *listing));
                    }
                }
            }
        }

        let admitted = self
            .evaluate(&buy_box.criteria, candidates, &cancel, &mut reports)
            .await;

        let merged = if request.dry_run {
            self.preview(request.company_id, admitted).await?
        } else {
            self.merge(request.company_id, buy_box.id, admitted, &cancel)
                .await?
        };
        reports.extend(merged);

        reports.sort_by_key(|(index, _, _)| *index);
        for (index, dedup_key, outcome) in reports {
            summary.report(index, dedup_key, outcome);
        }
        summary.finished_at = Utc::now();

        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::run_elapsed(elapsed_ms);
        info!(
            target = "buybox.ingest",
            run_id = %summary.run_id,
            admitted = summary.admitted_count,
            inserted = summary.inserted_count,
            updated = summary.updated_count,
            rejected = summary.rejected_count(),
            skipped = summary.skipped_count,
            errors = summary.errors.len(),
            cancelled = summary.cancelled,
            elapsed_ms = elapsed_ms as u64,
            "ingestion_run_finished"
        );
        Ok(summary)
    }

    async fn load_buy_box(&self, company_id: Uuid, id: Uuid) -> Result<BuyBox, FatalRunError> {
        let record = self
            .store
            .fetch_buy_box(id)
            .await?
            .filter(|record| record.company_id == company_id)
            .ok_or(FatalRunError::UnknownBuyBox(id))?;
        Ok(BuyBox::try_from(record)?)
    }

    /// Runs the match pipeline with at most `classifier_concurrency`
    /// listings in flight. Returns the admitted listings.
    async fn evaluate(
        &self,
        criteria: &BuyBoxCriteria,
        candidates: Vec<(usize, Listing)>,
        cancel: &CancellationToken,
        reports: &mut Vec<(usize, Option<DedupKey>, ListingOutcome)>,
    ) -> Vec<(usize, Listing)> {
        let pipeline = &self.pipeline;
        let evaluated: Vec<(usize, Listing, Option<Disposition>)> = stream::iter(candidates)
            .map(|(index, listing)| async move {
                if cancel.is_cancelled() {
                    return (index, listing, None);
                }
                let disposition = pipeline.evaluate(criteria, &listing).await;
                (index, listing, Some(disposition))
            })
            .buffer_unordered(self.config.classifier_concurrency)
            .collect()
            .await;

        let mut admitted = Vec::new();
        for (index, listing, disposition) in evaluated {
            match disposition {
                Some(Disposition::Admitted) => admitted.push((index, listing)),
                Some(Disposition::Rejected(rejection)) => reports.push((
                    index,
                    Some(listing.dedup_key),
                    ListingOutcome::Rejected {
                        stage: rejection.stage,
                        reason: rejection.reason,
                        detail: rejection.detail,
                    },
                )),
                None => reports.push((index, Some(listing.dedup_key), ListingOutcome::Cancelled)),
            }
        }
        admitted
    }

    /// Merges admitted listings. Keys are distinct within a run, so merges
    /// run concurrently; the store serializes writes per key across runs.
    async fn merge(
        &self,
        company_id: Uuid,
        buy_box_id: Uuid,
        admitted: Vec<(usize, Listing)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, Option<DedupKey>, ListingOutcome)>, FatalRunError> {
        let halt = cancel.child_token();
        let merger = &self.merger;
        let results: Vec<(usize, DedupKey, Option<Result<UpsertOutcome, MergeError>>)> =
            stream::iter(admitted)
                .map(|(index, listing)| {
                    let halt = halt.clone();
                    async move {
                        if halt.is_cancelled() {
                            return (index, listing.dedup_key, None);
                        }
                        let result = merger.merge(company_id, buy_box_id, &listing).await;
                        if matches!(result, Err(MergeError::Unavailable(_))) {
                            halt.cancel();
                        }
                        (index, listing.dedup_key, Some(result))
                    }
                })
                .buffer_unordered(self.config.merge_concurrency)
                .collect()
                .await;

        let mut reports = Vec::with_capacity(results.len());
        for (index, dedup_key, result) in results {
            let outcome = match result {
                None => ListingOutcome::Cancelled,
                Some(Ok(UpsertOutcome::Inserted { property_id })) => {
                    ListingOutcome::Inserted { property_id }
                }
                Some(Ok(UpsertOutcome::Updated { property_id })) => {
                    ListingOutcome::Updated { property_id }
                }
                Some(Err(MergeError::Unavailable(err))) => {
                    warn!(
                        target = "buybox.ingest",
                        dedup_key = %dedup_key,
                        error = %err,
                        "store_unavailable_aborting_run"
                    );
                    return Err(FatalRunError::StoreUnavailable(err.to_string()));
                }
                Some(Err(err)) => {
                    warn!(
                        target = "buybox.ingest",
                        dedup_key = %dedup_key,
                        error = %err,
                        "merge_failed"
                    );
                    ListingOutcome::MergeFailed {
                        error: err.to_string(),
                    }
                }
            };
            reports.push((index, Some(dedup_key), outcome));
        }
        Ok(reports)
    }

    async fn preview(
        &self,
        company_id: Uuid,
        admitted: Vec<(usize, Listing)>,
    ) -> Result<Vec<(usize, Option<DedupKey>, ListingOutcome)>, FatalRunError> {
        let mut reports = Vec::with_capacity(admitted.len());
        for (index, listing) in admitted {
            let preview = match self.merger.preview(company_id, &listing.dedup_key).await {
                Ok(preview) => Some(preview),
                Err(MergeError::Unavailable(err)) => {
                    return Err(FatalRunError::StoreUnavailable(err.to_string()));
                }
                Err(err) => {
                    warn!(target = "buybox.ingest", error = %err, "merge_preview_failed");
                    None
                }
            };
            reports.push((
                index,
                Some(listing.dedup_key),
                ListingOutcome::Admitted { preview },
            ));
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{
        ClassificationRequest, ClassifierError, DisabledClassifier, NeighborhoodVerdict,
    };
    use crate::criteria::{BuyBoxRecord, CriteriaInput, PriceMode};
    use crate::store::{MemoryStore, Property, PropertyUpsert};
    use async_trait::async_trait;
    use serde_json::json;
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    struct CountingClassifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NeighborhoodClassifier for CountingClassifier {
        async fn classify(
            &self,
            request: &ClassificationRequest,
        ) -> Result<NeighborhoodVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NeighborhoodVerdict {
                matches: request.address.contains("Union"),
                confidence: 0.8,
                explanation: "street lookup".into(),
            })
        }
    }

    /// Conflicts forever on one key, or is unreachable entirely.
    struct FaultyStore {
        inner: MemoryStore,
        poisoned_key: Option<DedupKey>,
        down: bool,
    }

    #[async_trait]
    impl PropertyStore for FaultyStore {
        async fn fetch_buy_box(&self, id: Uuid) -> Result<Option<BuyBoxRecord>, StoreError> {
            if self.down {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            self.inner.fetch_buy_box(id).await
        }

        async fn upsert_property(
            &self,
            upsert: &PropertyUpsert,
        ) -> Result<UpsertOutcome, StoreError> {
            if self.poisoned_key.as_ref() == Some(&upsert.dedup_key) {
                return Err(StoreError::Conflict("lock timeout".into()));
            }
            self.inner.upsert_property(upsert).await
        }

        async fn find_property(
            &self,
            company_id: Uuid,
            dedup_key: &DedupKey,
        ) -> Result<Option<Property>, StoreError> {
            self.inner.find_property(company_id, dedup_key).await
        }
    }

    /// Holds every upsert until the test releases it.
    struct GatedStore {
        inner: MemoryStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PropertyStore for GatedStore {
        async fn fetch_buy_box(&self, id: Uuid) -> Result<Option<BuyBoxRecord>, StoreError> {
            self.inner.fetch_buy_box(id).await
        }

        async fn upsert_property(
            &self,
            upsert: &PropertyUpsert,
        ) -> Result<UpsertOutcome, StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.upsert_property(upsert).await
        }

        async fn find_property(
            &self,
            company_id: Uuid,
            dedup_key: &DedupKey,
        ) -> Result<Option<Property>, StoreError> {
            self.inner.find_property(company_id, dedup_key).await
        }
    }

    fn test_config() -> IngestConfig {
        IngestConfig {
            classifier_timeout: Duration::from_millis(200),
            merge_backoff_base: Duration::from_millis(1),
            ..IngestConfig::default()
        }
    }

    fn scenario_criteria() -> CriteriaInput {
        CriteriaInput {
            zip_codes: vec!["44105".into()],
            price_mode: PriceMode::Absolute,
            price_min: Some(50_000.0),
            price_max: Some(150_000.0),
            ..CriteriaInput::default()
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        ingestor: Ingestor,
        company_id: Uuid,
        buy_box_id: Uuid,
    }

    impl Harness {
        async fn new(criteria: CriteriaInput) -> Self {
            Self::with_classifier(criteria, Arc::new(DisabledClassifier)).await
        }

        async fn with_classifier(
            criteria: CriteriaInput,
            classifier: Arc<dyn NeighborhoodClassifier>,
        ) -> Self {
            let store = Arc::new(MemoryStore::new());
            let company_id = Uuid::new_v4();
            let buy_box_id = Uuid::new_v4();
            store
                .insert_buy_box(BuyBoxRecord {
                    id: buy_box_id,
                    company_id,
                    name: Some("East side".into()),
                    criteria,
                })
                .await;
            let ingestor = Ingestor::new(store.clone(), classifier, test_config());
            Self {
                store,
                ingestor,
                company_id,
                buy_box_id,
            }
        }

        async fn run(&self, feed: Vec<Value>) -> RunSummary {
            self.ingestor
                .run(self.request(feed), CancellationToken::new())
                .await
                .expect("run")
        }

        fn request(&self, feed: Vec<Value>) -> RunRequest {
            RunRequest {
                company_id: self.company_id,
                buy_box_id: self.buy_box_id,
                feed,
                dry_run: false,
            }
        }
    }

    fn item(address: &str, zip: &str, price: u32) -> Value {
        json!({
            "address": address,
            "zip": zip,
            "city": "Cleveland",
            "price": price,
            "home_type": "Condo",
            "listing_type": "agent"
        })
    }

    #[tokio::test]
    async fn scenario_a_admits_and_inserts() {
        let harness = Harness::new(scenario_criteria()).await;
        let summary = harness.run(vec![item("7100 Union Ave", "44105", 120_000)]).await;
        assert_eq!(summary.admitted_count, 1);
        assert_eq!(summary.inserted_count, 1);
        assert!(matches!(
            summary.listings[0].outcome,
            ListingOutcome::Inserted { .. }
        ));
        let rows = harness.store.properties(harness.company_id).await;
        assert_eq!(rows[0].workflow_state, "Initial");
        assert_eq!(rows[0].buy_box_id, Some(harness.buy_box_id));
    }

    #[tokio::test]
    async fn scenario_b_rejects_at_zip() {
        let harness = Harness::new(scenario_criteria()).await;
        let summary = harness.run(vec![item("7100 Union Ave", "44106", 120_000)]).await;
        assert_eq!(summary.admitted_count, 0);
        assert_eq!(summary.rejected_by_stage.get("zip"), Some(&1));
        assert_eq!(summary.rejected_by_reason.get("zip_not_in_buy_box"), Some(&1));
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn scenario_c_rejects_at_city_match() {
        let harness = Harness::new(CriteriaInput {
            filter_by_city_match: true,
            cities: vec!["Cleveland".into()],
            ..scenario_criteria()
        })
        .await;
        let mut listing = item("5 Broadway", "44105", 120_000);
        listing["city"] = json!("Garfield Heights");
        let summary = harness.run(vec![listing]).await;
        assert_eq!(summary.rejected_by_stage.get("city_match"), Some(&1));
    }

    #[tokio::test]
    async fn literal_scenario_a_needs_no_listing_type() {
        let harness = Harness::new(scenario_criteria()).await;
        let summary = harness
            .run(vec![json!({
                "address": "7100 Union Ave",
                "zip": "44105",
                "price": 120000,
                "home_type": "Condo"
            })])
            .await;
        assert_eq!(summary.rejected_count(), 0);
        assert_eq!(summary.admitted_count, 1);
        assert_eq!(summary.inserted_count, 1);
    }

    #[tokio::test]
    async fn literal_scenario_b_rejects_at_zip() {
        let harness = Harness::new(scenario_criteria()).await;
        let summary = harness
            .run(vec![json!({"address": "7100 Union Ave", "zip": "44106", "price": 120000})])
            .await;
        assert_eq!(summary.rejected_by_stage.get("zip"), Some(&1));
        assert_eq!(summary.admitted_count, 0);
    }

    #[tokio::test]
    async fn literal_scenario_c_rejects_at_city_match() {
        let harness = Harness::new(CriteriaInput {
            zip_codes: vec!["44105".into()],
            filter_by_city_match: true,
            cities: vec!["Cleveland".into()],
            ..CriteriaInput::default()
        })
        .await;
        let summary = harness
            .run(vec![json!({
                "address": "5 Broadway",
                "zip": "44105",
                "city": "Garfield Heights"
            })])
            .await;
        assert_eq!(summary.rejected_by_stage.get("city_match"), Some(&1));
        assert_eq!(summary.rejected_by_reason.get("city_mismatch"), Some(&1));
        assert_eq!(summary.rejected_count(), 1);
    }

    #[tokio::test]
    async fn stale_listing_with_float_age_is_rejected() {
        let harness = Harness::new(CriteriaInput {
            max_days_on_market: Some(90),
            ..scenario_criteria()
        })
        .await;
        let mut listing = item("7100 Union Ave", "44105", 120_000);
        listing["daysOnMarket"] = json!(400.0);
        let summary = harness.run(vec![listing]).await;
        assert_eq!(summary.rejected_by_reason.get("stale_listing"), Some(&1));
        assert!(harness.store.properties(harness.company_id).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_field_spellings_are_ingested() {
        let harness = Harness::new(scenario_criteria()).await;
        let summary = harness
            .run(vec![json!({
                "id": "abc",
                "zpid": 99812,
                "address": "7100 Union Ave",
                "zip": "44105",
                "zipcode": "44105",
                "url": "https://example.com/a",
                "detailUrl": "https://example.com/b",
                "price": 120000
            })])
            .await;
        assert!(summary.errors.is_empty());
        assert_eq!(summary.inserted_count, 1);
    }

    #[tokio::test]
    async fn scenario_d_rerun_keeps_workflow_state() {
        let harness = Harness::new(scenario_criteria()).await;
        harness.run(vec![item("7100 Union Ave", "44105", 120_000)]).await;
        let key = DedupKey::for_parts("7100 Union Ave", "44105", None).expect("key");
        harness
            .store
            .edit_property(harness.company_id, &key, |property| {
                property.workflow_state = "Negotiating".into();
            })
            .await;

        let summary = harness.run(vec![item("7100 Union Ave", "44105", 115_000)]).await;
        assert_eq!(summary.updated_count, 1);
        let rows = harness.store.properties(harness.company_id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].listing.price, Some(115_000.0));
        assert_eq!(rows[0].workflow_state, "Negotiating");
    }

    #[tokio::test]
    async fn rerunning_identical_feed_is_idempotent() {
        let harness = Harness::new(scenario_criteria()).await;
        let feed = vec![
            item("7100 Union Ave", "44105", 120_000),
            item("4410 E 71st St", "44105", 80_000),
            item("12 Fleet Ave", "44105", 140_000),
        ];
        let first = harness.run(feed.clone()).await;
        let after_first = harness.store.properties(harness.company_id).await;
        let second = harness.run(feed).await;
        let after_second = harness.store.properties(harness.company_id).await;

        assert_eq!(first.inserted_count, 3);
        assert_eq!(second.inserted_count, 0);
        assert_eq!(second.updated_count, 3);
        assert_eq!(after_first.len(), after_second.len());
        for (before, after) in after_first.iter().zip(&after_second) {
            assert_eq!(before.id, after.id);
            assert_eq!(before.listing, after.listing);
            assert_eq!(before.workflow_state, after.workflow_state);
            assert!(after.last_seen_at >= before.last_seen_at);
        }
    }

    #[tokio::test]
    async fn admitted_properties_respect_zip_and_price_bounds() {
        let harness = Harness::new(CriteriaInput {
            zip_codes: vec!["44105".into(), "44127".into()],
            ..scenario_criteria()
        })
        .await;
        let zips = ["44105", "44106", "44127", "44128"];
        let feed: Vec<Value> = (0..40u32)
            .map(|i| {
                item(
                    &format!("{} Kinsman Rd", 100 + i),
                    zips[(i % 4) as usize],
                    20_000 + i * 5_000,
                )
            })
            .collect();
        let summary = harness.run(feed).await;
        assert!(summary.inserted_count > 0);

        let allowed: BTreeSet<&str> = ["44105", "44127"].into_iter().collect();
        for property in harness.store.properties(harness.company_id).await {
            assert!(allowed.contains(property.listing.zip.as_str()));
            let price = property.listing.price.expect("price");
            assert!((50_000.0..=150_000.0).contains(&price));
        }
    }

    #[tokio::test]
    async fn one_malformed_item_is_contained() {
        let harness = Harness::new(scenario_criteria()).await;
        let mut feed: Vec<Value> = (0..99u32)
            .map(|i| item(&format!("{} Broadway", i + 1), "44105", 60_000 + i * 100))
            .collect();
        feed.insert(42, json!({"price": 100000, "zip": "44105"}));

        let summary = harness.run(feed).await;
        let dispositions = summary
            .listings
            .iter()
            .filter(|report| !matches!(report.outcome, ListingOutcome::Skipped { .. }))
            .count();
        assert_eq!(summary.received_count, 100);
        assert_eq!(dispositions, 99);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].index, 42);
        assert_eq!(summary.errors[0].kind, RunErrorKind::ValidationError);
        assert_eq!(summary.inserted_count, 99);
    }

    #[tokio::test]
    async fn duplicate_addresses_share_one_classifier_call() {
        let classifier = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
        });
        let harness = Harness::with_classifier(
            CriteriaInput {
                filter_by_neighborhoods: true,
                neighborhoods: vec!["Slavic Village".into()],
                ..scenario_criteria()
            },
            classifier.clone(),
        )
        .await;
        let summary = harness
            .run(vec![
                item("7100 Union Ave", "44105", 120_000),
                item("7100 UNION AVENUE", "44105", 119_000),
                item("5 Broadway", "44105", 90_000),
            ])
            .await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.coalesced_count, 1);
        assert_eq!(summary.inserted_count, 1);
        assert_eq!(summary.rejected_by_reason.get("neighborhood_mismatch"), Some(&1));
        assert!(matches!(
            summary.listings[1].outcome,
            ListingOutcome::Coalesced { first_index: 0 }
        ));
    }

    #[tokio::test]
    async fn unavailable_classifier_rejects_without_run_errors() {
        let harness = Harness::new(CriteriaInput {
            filter_by_neighborhoods: true,
            neighborhoods: vec!["Slavic Village".into()],
            ..scenario_criteria()
        })
        .await;
        let summary = harness.run(vec![item("7100 Union Ave", "44105", 120_000)]).await;
        assert_eq!(
            summary.rejected_by_reason.get("classification_unavailable"),
            Some(&1)
        );
        assert!(summary.errors.is_empty());
        assert!(harness.store.properties(harness.company_id).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_or_foreign_buy_box_is_fatal() {
        let harness = Harness::new(scenario_criteria()).await;
        let mut request = harness.request(vec![]);
        request.buy_box_id = Uuid::new_v4();
        let err = harness
            .ingestor
            .run(request, CancellationToken::new())
            .await
            .expect_err("unknown");
        assert!(matches!(err, FatalRunError::UnknownBuyBox(_)));

        let mut request = harness.request(vec![]);
        request.company_id = Uuid::new_v4();
        let err = harness
            .ingestor
            .run(request, CancellationToken::new())
            .await
            .expect_err("foreign");
        assert_eq!(err.code(), "unknown_buy_box");
    }

    #[tokio::test]
    async fn invalid_stored_criteria_is_fatal() {
        let harness = Harness::new(CriteriaInput {
            filter_by_city_match: true,
            ..scenario_criteria()
        })
        .await;
        let err = harness
            .ingestor
            .run(harness.request(vec![]), CancellationToken::new())
            .await
            .expect_err("invalid");
        assert!(matches!(err, FatalRunError::InvalidCriteria(_)));
    }

    #[tokio::test]
    async fn unreachable_store_is_fatal() {
        let store = Arc::new(FaultyStore {
            inner: MemoryStore::new(),
            poisoned_key: None,
            down: true,
        });
        let ingestor = Ingestor::new(store, Arc::new(DisabledClassifier), test_config());
        let err = ingestor
            .run(
                RunRequest {
                    company_id: Uuid::new_v4(),
                    buy_box_id: Uuid::new_v4(),
                    feed: vec![item("7100 Union Ave", "44105", 120_000)],
                    dry_run: false,
                },
                CancellationToken::new(),
            )
            .await
            .expect_err("down");
        assert!(matches!(err, FatalRunError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn persistent_conflict_fails_only_that_listing() {
        let inner = MemoryStore::new();
        let company_id = Uuid::new_v4();
        let buy_box_id = Uuid::new_v4();
        inner
            .insert_buy_box(BuyBoxRecord {
                id: buy_box_id,
                company_id,
                name: None,
                criteria: scenario_criteria(),
            })
            .await;
        let store = Arc::new(FaultyStore {
            inner,
            poisoned_key: DedupKey::for_parts("12 Fleet Ave", "44105", None),
            down: false,
        });
        let ingestor = Ingestor::new(store, Arc::new(DisabledClassifier), test_config());
        let summary = ingestor
            .run(
                RunRequest {
                    company_id,
                    buy_box_id,
                    feed: vec![
                        item("7100 Union Ave", "44105", 120_000),
                        item("12 Fleet Ave", "44105", 140_000),
                    ],
                    dry_run: false,
                },
                CancellationToken::new(),
            )
            .await
            .expect("run");
        assert_eq!(summary.inserted_count, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, RunErrorKind::MergeFailed);
        assert!(summary.errors[0].message.contains("4 attempts"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let harness = Harness::new(scenario_criteria()).await;
        let mut request = harness.request(vec![item("7100 Union Ave", "44105", 120_000)]);
        request.dry_run = true;
        let summary = harness
            .ingestor
            .run(request, CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(summary.admitted_count, 1);
        assert_eq!(summary.inserted_count, 0);
        assert_eq!(
            summary.listings[0].outcome,
            ListingOutcome::Admitted {
                preview: Some(MergePreview::WouldInsert)
            }
        );
        assert!(harness.store.properties(harness.company_id).await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_run_processes_nothing_further() {
        let harness = Harness::new(scenario_criteria()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = harness
            .ingestor
            .run(
                harness.request(vec![
                    item("7100 Union Ave", "44105", 120_000),
                    item("12 Fleet Ave", "44105", 140_000),
                ]),
                cancel,
            )
            .await
            .expect("run");
        assert!(summary.cancelled);
        assert_eq!(summary.inserted_count, 0);
        assert!(
            summary
                .listings
                .iter()
                .all(|report| report.outcome == ListingOutcome::Cancelled)
        );
        assert!(harness.store.properties(harness.company_id).await.is_empty());
    }

    #[tokio::test]
    async fn cancelling_mid_run_finishes_the_merge_in_flight() {
        let inner = MemoryStore::new();
        let company_id = Uuid::new_v4();
        let buy_box_id = Uuid::new_v4();
        inner
            .insert_buy_box(BuyBoxRecord {
                id: buy_box_id,
                company_id,
                name: None,
                criteria: scenario_criteria(),
            })
            .await;
        let store = Arc::new(GatedStore {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
        });
        let ingestor = Ingestor::new(
            store.clone(),
            Arc::new(DisabledClassifier),
            IngestConfig {
                merge_concurrency: 1,
                ..test_config()
            },
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                ingestor
                    .run(
                        RunRequest {
                            company_id,
                            buy_box_id,
                            feed: vec![
                                item("7100 Union Ave", "44105", 120_000),
                                item("12 Fleet Ave", "44105", 140_000),
                                item("4410 E 71st St", "44105", 80_000),
                            ],
                            dry_run: false,
                        },
                        cancel,
                    )
                    .await
            }
        });

        store.entered.notified().await;
        cancel.cancel();
        store.release.notify_one();

        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run finished")
            .expect("join")
            .expect("run");
        assert!(summary.cancelled);
        assert_eq!(summary.inserted_count, 1);
        let cancelled = summary
            .listings
            .iter()
            .filter(|report| report.outcome == ListingOutcome::Cancelled)
            .count();
        assert_eq!(cancelled, 2);
        assert_eq!(store.inner.properties(company_id).await.len(), 1);
    }

    #[test]
    fn summary_round_trips_through_json() {
        let request = RunRequest {
            company_id: Uuid::new_v4(),
            buy_box_id: Uuid::new_v4(),
            feed: vec![],
            dry_run: false,
        };
        let mut summary = RunSummary::new(&request);
        summary.report(
            0,
            DedupKey::for_parts("1 Main St", "44105", None),
            ListingOutcome::Rejected {
                stage: FilterStage::Price,
                reason: RejectReason::AbovePriceMax,
                detail: None,
            },
        );
        let text = serde_json::to_string(&summary).expect("json");
        let back: RunSummary = serde_json::from_str(&text).expect("summary");
        assert_eq!(back.listings, summary.listings);
        assert_eq!(back.rejected_count(), 1);
    }
}
