use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Body of `POST /buy-boxes/{id}/ingest`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub feed: Vec<Value>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Body of `POST /jobs/ingest`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestJobRequest {
    pub buy_box_id: Uuid,
    pub feed: Vec<Value>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: Some(detail.into()),
        }
    }
}
