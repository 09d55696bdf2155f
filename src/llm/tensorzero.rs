use crate::http::build_client;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: String,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            function_name: std::env::var("TENSORZERO_FUNCTION")
                .unwrap_or_else(|_| "neighborhood_classifier".into()),
            model: std::env::var("TENSORZERO_MODEL").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("gateway responded with {0}")]
    Status(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Client for a TensorZero-compatible inference gateway.
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    /// Runs the configured function and returns the first text block.
    pub async fn complete(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let body = InferenceRequest {
            function_name: &self.config.function_name,
            model_name: self.config.model.as_deref(),
            input: InferenceInput { messages },
            stream: false,
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Status(response.status()));
        }

        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        if let Some(usage) = &payload.usage {
            debug!(
                target = "buybox.llm",
                function = %self.config.function_name,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "inference_usage"
            );
        }

        payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .and_then(|item| item.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    function_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    input: InferenceInput<'a>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct InferenceInput<'a> {
    messages: &'a [LlmMessage],
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}
