use super::{ListingFields, Property, PropertyStore, PropertyUpsert, StoreError, UpsertOutcome};
use crate::criteria::BuyBoxRecord;
use crate::http::build_client;
use crate::listing::DedupKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use urlencoding::encode;
use uuid::Uuid;

/// PostgREST-backed store. The atomic upsert lives in the database as the
/// `ingest_property` function (see `migrations/0001_properties.sql`).
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct IngestPropertyArgs<'a> {
    p_company_id: Uuid,
    p_dedup_key: &'a DedupKey,
    p_buy_box_id: Uuid,
    p_seen_at: DateTime<Utc>,
    p_listing: &'a ListingFields,
}

#[derive(Debug, Deserialize)]
struct IngestPropertyRow {
    property_id: Uuid,
    inserted: bool,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Serialization failures and deadlocks are worth another attempt.
const TRANSIENT_PG_CODES: &[&str] = &["40001", "40P01", "55P03"];

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(base_url, service_key))
    }

    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http: build_client(),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(failure_from_response(status, &body))
    }

    async fn first_row<T: DeserializeOwned>(response: Response) -> Result<Option<T>, StoreError> {
        let mut rows: Vec<T> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(rows.pop())
    }
}

#[async_trait]
impl PropertyStore for SupabaseStore {
    async fn fetch_buy_box(&self, id: Uuid) -> Result<Option<BuyBoxRecord>, StoreError> {
        let url = format!(
            "{}/rest/v1/buy_boxes?id=eq.{}&select=*&limit=1",
            self.base_url, id
        );
        let response = self.send(self.http.get(url)).await?;
        Self::first_row(response).await
    }

    async fn upsert_property(&self, upsert: &PropertyUpsert) -> Result<UpsertOutcome, StoreError> {
        let url = format!("{}/rest/v1/rpc/ingest_property", self.base_url);
        let args = IngestPropertyArgs {
            p_company_id: upsert.company_id,
            p_dedup_key: &upsert.dedup_key,
            p_buy_box_id: upsert.buy_box_id,
            p_seen_at: upsert.seen_at,
            p_listing: &upsert.listing,
        };
        let response = self.send(self.http.post(url).json(&args)).await?;
        let row: IngestPropertyRow = Self::first_row(response)
            .await?
            .ok_or_else(|| StoreError::Deserialize("ingest_property returned no row".into()))?;
        Ok(if row.inserted {
            UpsertOutcome::Inserted {
                property_id: row.property_id,
            }
        } else {
            UpsertOutcome::Updated {
                property_id: row.property_id,
            }
        })
    }

    async fn find_property(
        &self,
        company_id: Uuid,
        dedup_key: &DedupKey,
    ) -> Result<Option<Property>, StoreError> {
        let url = format!(
            "{}/rest/v1/properties?company_id=eq.{}&dedup_key=eq.{}&select=*&limit=1",
            self.base_url,
            company_id,
            encode(dedup_key.as_str())
        );
        let response = self.send(self.http.get(url)).await?;
        Self::first_row(response).await
    }
}

fn failure_from_response(status: StatusCode, body: &str) -> StoreError {
    let parsed = serde_json::from_str::<PostgrestError>(body).ok();
    let code = parsed.as_ref().and_then(|err| err.code.as_deref());
    let message = parsed
        .as_ref()
        .and_then(|err| err.message.clone())
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == StatusCode::CONFLICT
        || code.is_some_and(|code| TRANSIENT_PG_CODES.contains(&code))
    {
        StoreError::Conflict(message)
    } else if status.is_server_error() || status == StatusCode::UNAUTHORIZED {
        StoreError::Unavailable(message)
    } else {
        StoreError::Rejected(message)
    }
}
