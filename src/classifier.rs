use crate::config::IngestConfig;
use crate::llm::{LlmClient, LlmConfig, LlmMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

const SYSTEM_PROMPT: &str = r#"
You are a real-estate location analyst. Decide whether a property lies inside any of the candidate
neighborhoods. Use the street address, city, zip code and listing description. Respond with a JSON
object only: {"matches": boolean, "confidence": number between 0 and 1, "explanation": string}.
When you cannot place the address, answer matches=false with a low confidence.
"#;

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRequest {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub candidate_neighborhoods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborhoodVerdict {
    pub matches: bool,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("neighborhood classifier is disabled")]
    Disabled,
    #[error("classifier request failed: {0}")]
    Request(String),
    #[error("unable to parse classifier verdict: {0}")]
    Parse(String),
}

/// External judgment of whether an address sits in one of a set of
/// neighborhoods. Calls may fail or hang; callers bound them with a timeout.
#[async_trait]
pub trait NeighborhoodClassifier: Send + Sync {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<NeighborhoodVerdict, ClassifierError>;
}

pub struct LlmNeighborhoodClassifier {
    llm: LlmClient,
}

impl LlmNeighborhoodClassifier {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl NeighborhoodClassifier for LlmNeighborhoodClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<NeighborhoodVerdict, ClassifierError> {
        let payload = json!({
            "address": request.address,
            "description": request.description,
            "candidate_neighborhoods": request.candidate_neighborhoods,
        });
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(payload.to_string()),
        ];
        let text = self
            .llm
            .complete(&messages)
            .await
            .map_err(|err| ClassifierError::Request(err.to_string()))?;
        parse_verdict(&text)
    }
}

/// Used when no gateway is configured; every call fails so neighborhood
/// filtering stays fail-closed.
pub struct DisabledClassifier;

#[async_trait]
impl NeighborhoodClassifier for DisabledClassifier {
    async fn classify(
        &self,
        _request: &ClassificationRequest,
    ) -> Result<NeighborhoodVerdict, ClassifierError> {
        Err(ClassifierError::Disabled)
    }
}

pub fn from_config(config: &IngestConfig) -> Arc<dyn NeighborhoodClassifier> {
    if config.classifier_enabled {
        Arc::new(LlmNeighborhoodClassifier::new(LlmClient::new(
            LlmConfig::from_env(),
        )))
    } else {
        Arc::new(DisabledClassifier)
    }
}

pub fn parse_verdict(text: &str) -> Result<NeighborhoodVerdict, ClassifierError> {
    let cleaned = strip_markdown_fence(text);
    let mut verdict: NeighborhoodVerdict =
        serde_json::from_str(&cleaned).map_err(|err| ClassifierError::Parse(err.to_string()))?;
    verdict.confidence = if verdict.confidence.is_finite() {
        verdict.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(verdict)
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .skip(1)
        .take_while(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}
