use crate::listing::{DedupKey, Listing};
use crate::store::{ListingFields, PropertyStore, PropertyUpsert, StoreError, UpsertOutcome};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge conflict persisted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("merge failed: {0}")]
    Failed(#[source] StoreError),
    /// The store cannot be reached at all; this ends the run.
    #[error(transparent)]
    Unavailable(StoreError),
}

/// What a merge would do, reported by dry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePreview {
    WouldInsert,
    WouldUpdate,
}

/// Resolves admitted listings against persisted properties.
#[derive(Clone)]
pub struct Merger {
    store: Arc<dyn PropertyStore>,
    max_retries: u32,
    backoff_base: Duration,
}

impl Merger {
    pub fn new(store: Arc<dyn PropertyStore>, max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            store,
            max_retries,
            backoff_base,
        }
    }

    /// Inserts a new property or refreshes the listing-sourced fields of the
    /// existing one. Transient conflicts are retried with exponential backoff.
    pub async fn merge(
        &self,
        company_id: Uuid,
        buy_box_id: Uuid,
        listing: &Listing,
    ) -> Result<UpsertOutcome, MergeError> {
        let upsert = PropertyUpsert {
            company_id,
            dedup_key: listing.dedup_key.clone(),
            buy_box_id,
            listing: ListingFields::from(listing),
            seen_at: Utc::now(),
        };

        let mut attempt: u32 = 0;
        loop {
            match self.store.upsert_property(&upsert).await {
                Ok(outcome) => {
                    crate::metrics::merge_outcome(match outcome {
                        UpsertOutcome::Inserted { .. } => "inserted",
                        UpsertOutcome::Updated { .. } => "updated",
                    });
                    return Ok(outcome);
                }
                Err(StoreError::Conflict(message)) if attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        target = "buybox.merge",
                        dedup_key = %upsert.dedup_key,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "merge_conflict_retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err @ StoreError::Conflict(_)) => {
                    crate::metrics::merge_outcome("failed");
                    return Err(MergeError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                Err(err @ StoreError::Unavailable(_)) => return Err(MergeError::Unavailable(err)),
                Err(err) => {
                    crate::metrics::merge_outcome("failed");
                    return Err(MergeError::Failed(err));
                }
            }
        }
    }

    pub async fn preview(
        &self,
        company_id: Uuid,
        dedup_key: &DedupKey,
    ) -> Result<MergePreview, MergeError> {
        match self.store.find_property(company_id, dedup_key).await {
            Ok(Some(_)) => Ok(MergePreview::WouldUpdate),
            Ok(None) => Ok(MergePreview::WouldInsert),
            Err(err @ StoreError::Unavailable(_)) => Err(MergeError::Unavailable(err)),
            Err(err) => Err(MergeError::Failed(err)),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter_cap = (self.backoff_base.as_millis() as u64 / 2).max(1);
        exponential + Duration::from_millis(rand::rng().random_range(0..jitter_cap))
    }
}
