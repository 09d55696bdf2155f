pub mod memory;
pub mod supabase;

use crate::criteria::{BuyBoxRecord, ListingType};
use crate::listing::{DedupKey, Listing};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

pub const DEFAULT_WORKFLOW_STATE: &str = "Initial";

/// Columns that come from the listing feed. Everything else on a
/// [`Property`] belongs to the user and is never written by ingestion
/// after the row exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingFields {
    pub source_id: Option<String>,
    pub address: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: String,
    pub price: Option<f64>,
    pub price_per_sqft: Option<f64>,
    pub home_type: Option<String>,
    pub listing_type: Option<ListingType>,
    pub days_on_market: Option<u32>,
    pub bedrooms: Option<f32>,
    pub bathrooms: Option<f32>,
    pub sqft: Option<f64>,
    pub status: Option<String>,
    pub agent_name: Option<String>,
    pub agent_phone: Option<String>,
    pub agent_email: Option<String>,
    pub brokerage: Option<String>,
    pub listing_url: Option<String>,
    pub description: Option<String>,
}

impl From<&Listing> for ListingFields {
    fn from(listing: &Listing) -> Self {
        Self {
            source_id: listing.source_id.clone(),
            address: listing.address.clone(),
            city: listing.city.clone(),
            state: listing.state.clone(),
            zip: listing.zip.clone(),
            price: listing.price,
            price_per_sqft: listing.price_per_sqft,
            home_type: listing.home_type.clone(),
            listing_type: listing.listing_type,
            days_on_market: listing.days_on_market,
            bedrooms: listing.bedrooms,
            bathrooms: listing.bathrooms,
            sqft: listing.sqft,
            status: listing.status.clone(),
            agent_name: listing.agent.name.clone(),
            agent_phone: listing.agent.phone.clone(),
            agent_email: listing.agent.email.clone(),
            brokerage: listing.agent.brokerage.clone(),
            listing_url: listing.listing_url.clone(),
            description: listing.description.clone(),
        }
    }
}

impl ListingFields {
    /// Market fields take the newest sighting as-is; descriptive fields only
    /// fill gaps. Address, city, state and zip keep their first-seen values.
    pub fn refresh_from(&mut self, newer: &ListingFields) {
        self.price = newer.price;
        self.price_per_sqft = newer.price_per_sqft;
        self.days_on_market = newer.days_on_market;
        self.status = newer.status.clone();
        self.agent_name = newer.agent_name.clone();
        self.agent_phone = newer.agent_phone.clone();
        self.agent_email = newer.agent_email.clone();
        self.brokerage = newer.brokerage.clone();
        self.listing_url = newer.listing_url.clone();

        fill(&mut self.source_id, &newer.source_id);
        fill(&mut self.home_type, &newer.home_type);
        fill(&mut self.listing_type, &newer.listing_type);
        fill(&mut self.bedrooms, &newer.bedrooms);
        fill(&mut self.bathrooms, &newer.bathrooms);
        fill(&mut self.sqft, &newer.sqft);
        fill(&mut self.description, &newer.description);
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, newer: &Option<T>) {
    if newer.is_some() {
        slot.clone_from(newer);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub company_id: Uuid,
    pub dedup_key: DedupKey,
    #[serde(flatten)]
    pub listing: ListingFields,
    pub workflow_state: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<Uuid>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub buy_box_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Property {
    pub fn from_upsert(upsert: &PropertyUpsert) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id: upsert.company_id,
            dedup_key: upsert.dedup_key.clone(),
            listing: upsert.listing.clone(),
            workflow_state: DEFAULT_WORKFLOW_STATE.to_string(),
            notes: None,
            assigned_to: None,
            urgency: None,
            buy_box_id: Some(upsert.buy_box_id),
            created_at: upsert.seen_at,
            last_seen_at: upsert.seen_at,
        }
    }

    /// Applies a re-sighting. User-owned fields are left alone and the first
    /// admitting Buy Box keeps ownership.
    pub fn refresh(&mut self, upsert: &PropertyUpsert) {
        self.listing.refresh_from(&upsert.listing);
        if self.buy_box_id.is_none() {
            self.buy_box_id = Some(upsert.buy_box_id);
        }
        self.last_seen_at = upsert.seen_at;
    }
}

/// One atomic insert-or-refresh keyed on `(company_id, dedup_key)`.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyUpsert {
    pub company_id: Uuid,
    pub dedup_key: DedupKey,
    pub buy_box_id: Uuid,
    pub listing: ListingFields,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted { property_id: Uuid },
    Updated { property_id: Uuid },
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient contention; safe to retry.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn fetch_buy_box(&self, id: Uuid) -> Result<Option<BuyBoxRecord>, StoreError>;

    /// Must be a single atomic conditional write: concurrent calls for the
    /// same key never produce two rows or lose an update.
    async fn upsert_property(&self, upsert: &PropertyUpsert) -> Result<UpsertOutcome, StoreError>;

    async fn find_property(
        &self,
        company_id: Uuid,
        dedup_key: &DedupKey,
    ) -> Result<Option<Property>, StoreError>;
}

pub async fn from_env() -> Result<Arc<dyn PropertyStore>, StoreError> {
    if let Some(store) = SupabaseStore::from_env() {
        info!(target = "buybox.store", backend = "supabase", "property store ready");
        return Ok(Arc::new(store));
    }
    let store = MemoryStore::from_env().await?;
    info!(target = "buybox.store", backend = "memory", "property store ready");
    Ok(Arc::new(store))
}
