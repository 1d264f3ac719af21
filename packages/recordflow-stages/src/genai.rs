//! Minimal client for the generative-model endpoint used by the research
//! and finalize stages. Prompt in, text plus token counts out; retry
//! classification follows the shared HTTP rules.

use crate::http;
use recordflow_orchestration::{ExecutorError, TokenUsage};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl GenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.0-flash".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

pub struct GenAiClient {
    client: reqwest::Client,
    config: GenAiConfig,
}

impl GenAiClient {
    pub fn new(config: GenAiConfig) -> Result<Self, ExecutorError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(120))?,
            config,
        })
    }

    /// One generateContent call. Empty candidate lists count as transient:
    /// the endpoint returns them under load.
    pub async fn generate(&self, prompt: &str) -> Result<(String, TokenUsage), ExecutorError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&json!({
                "contents": [{ "parts": [{ "text": prompt }] }]
            }))
            .send()
            .await
            .map_err(http::classify_transport)?;

        http::classify_status(response.status())?;
        let body: GenerateResponse = response.json().await.map_err(http::classify_transport)?;

        let text: String = body
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ExecutorError::transient("model returned no candidates"));
        }

        let usage = body
            .usage_metadata
            .map(|u| TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok((text, usage))
    }
}
