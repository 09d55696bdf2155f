use super::{Property, PropertyStore, PropertyUpsert, StoreError, UpsertOutcome};
use crate::criteria::BuyBoxRecord;
use crate::listing::DedupKey;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

/// Process-local store. The lookup and the write of an upsert happen under
/// one lock acquisition, which makes them a single atomic step.
#[derive(Default)]
pub struct MemoryStore {
    buy_boxes: RwLock<HashMap<Uuid, BuyBoxRecord>>,
    properties: Mutex<HashMap<(Uuid, DedupKey), Property>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds buy boxes from the JSON array at `BUY_BOXES_PATH`, if set.
    pub async fn from_env() -> Result<Self, StoreError> {
        let store = Self::new();
        let Ok(path) = std::env::var("BUY_BOXES_PATH") else {
            return Ok(store);
        };
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| StoreError::Unavailable(format!("{path}: {err}")))?;
        let records: Vec<BuyBoxRecord> = serde_json::from_str(&raw)
            .map_err(|err| StoreError::Deserialize(format!("{path}: {err}")))?;
        let count = records.len();
        for record in records {
            store.insert_buy_box(record).await;
        }
        info!(target = "buybox.store", path = %path, count, "seeded buy boxes");
        Ok(store)
    }

    pub async fn insert_buy_box(&self, record: BuyBoxRecord) {
        self.buy_boxes.write().await.insert(record.id, record);
    }

    #[cfg(test)]
    pub async fn properties(&self, company_id: Uuid) -> Vec<Property> {
        let mut rows: Vec<Property> = self
            .properties
            .lock()
            .await
            .values()
            .filter(|property| property.company_id == company_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        rows
    }

    /// Stands in for the user-facing CRUD screens in tests.
    #[cfg(test)]
    pub async fn edit_property(
        &self,
        company_id: Uuid,
        dedup_key: &DedupKey,
        edit: impl FnOnce(&mut Property),
    ) {
        if let Some(property) = self
            .properties
            .lock()
            .await
            .get_mut(&(company_id, dedup_key.clone()))
        {
            edit(property);
        }
    }
}

#[async_trait]
impl PropertyStore for MemoryStore {
    async fn fetch_buy_box(&self, id: Uuid) -> Result<Option<BuyBoxRecord>, StoreError> {
        Ok(self.buy_boxes.read().await.get(&id).cloned())
    }

    async fn upsert_property(&self, upsert: &PropertyUpsert) -> Result<UpsertOutcome, StoreError> {
        let mut guard = self.properties.lock().await;
        let key = (upsert.company_id, upsert.dedup_key.clone());
        match guard.get_mut(&key) {
            Some(existing) => {
                existing.refresh(upsert);
                Ok(UpsertOutcome::Updated {
                    property_id: existing.id,
                })
            }
            None => {
                let property = Property::from_upsert(upsert);
                let property_id = property.id;
                guard.insert(key, property);
                Ok(UpsertOutcome::Inserted { property_id })
            }
        }
    }

    async fn find_property(
        &self,
        company_id: Uuid,
        dedup_key: &DedupKey,
    ) -> Result<Option<Property>, StoreError> {
        Ok(self
            .properties
            .lock()
            .await
            .get(&(company_id, dedup_key.clone()))
            .cloned())
    }
}
