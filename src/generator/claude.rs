//! LLM client seam and the Anthropic messages-API implementation.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::GeneratorConfig;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Transport-level outcome of one completion attempt; the generator's retry
/// policy is written against these variants.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<u64> },
    #[error("api error (HTTP {code}): {message}")]
    Status { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Anthropic messages-API client.
pub struct ClaudeApiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl ClaudeApiClient {
    pub fn new(http: reqwest::Client, cfg: &GeneratorConfig) -> Self {
        Self {
            http,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }
}

#[async_trait]
impl LlmClient for ClaudeApiClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let payload = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .http
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(LlmError::RateLimited { retry_after });
        }

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::Status {
                code: status.as_u16(),
                message: truncate(&body, 500).to_string(),
            });
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_concatenates_content_blocks() {
        let body = r###"{"content":[{"type":"text","text":"## Summary\n"},{"type":"text","text":"done"}]}"###;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        let text: String = parsed.content.into_iter().map(|b| b.text).collect();
        assert_eq!(text, "## Summary\ndone");
    }

    #[test]
    fn empty_content_parses_to_empty_text() {
        let parsed: MessagesResponse = serde_json::from_str(r#"{"content":[]}"#).unwrap();
        assert!(parsed.content.is_empty());
    }
}
