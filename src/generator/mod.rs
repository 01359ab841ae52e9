//! Minutes generation: prompt template rendering and the LLM call.
//!
//! The template is loaded once at startup and must contain exactly one
//! `{transcript}` placeholder. Rendering is literal string replacement, not
//! format-string interpolation, so transcript content can never be
//! re-interpreted as a placeholder.

pub mod claude;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::GeneratorConfig;
use crate::errors::{PipelineError, Result};
use claude::{LlmClient, LlmError};

const TRANSCRIPT_PLACEHOLDER: &str = "{transcript}";
const DATE_PLACEHOLDER: &str = "{date}";
const SPEAKERS_PLACEHOLDER: &str = "{speakers}";

pub struct MinutesGenerator {
    template: String,
    client: Arc<dyn LlmClient>,
    max_retries: u32,
    model: String,
}

impl std::fmt::Debug for MinutesGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinutesGenerator")
            .field("template", &self.template)
            .field("max_retries", &self.max_retries)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl MinutesGenerator {
    /// Load the prompt template and bind the LLM client. Called once at
    /// startup; a malformed template aborts the process.
    pub fn load(cfg: &GeneratorConfig, client: Arc<dyn LlmClient>) -> Result<Self> {
        let path = Path::new(&cfg.prompt_template_path);
        let template = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Generation(format!(
                "prompt template not readable at {}: {e}",
                path.display()
            ))
        })?;

        let placeholder_count = template.matches(TRANSCRIPT_PLACEHOLDER).count();
        if placeholder_count != 1 {
            return Err(PipelineError::Generation(format!(
                "prompt template must contain exactly one {TRANSCRIPT_PLACEHOLDER} placeholder \
                 (found {placeholder_count} in {})",
                path.display()
            )));
        }

        info!(
            "Minutes generator ready (model={}, template={}, {} chars)",
            cfg.model,
            path.display(),
            template.len()
        );

        Ok(Self {
            template,
            client,
            max_retries: cfg.max_retries,
            model: cfg.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Fill in template variables by literal replacement.
    ///
    /// The transcript is substituted last and exactly once, so placeholder
    /// look-alikes inside the transcript survive verbatim.
    pub fn render_prompt(&self, transcript: &str, date: &str, speakers: &str) -> String {
        self.template
            .replace(DATE_PLACEHOLDER, date)
            .replace(SPEAKERS_PLACEHOLDER, speakers)
            .replacen(TRANSCRIPT_PLACEHOLDER, transcript, 1)
    }

    /// Generate minutes markdown from a merged transcript.
    ///
    /// Retries rate limits (honoring a Retry-After hint), 5xx and transport
    /// errors with exponential backoff; any other client error fails the
    /// attempt immediately. Empty content is a generation failure.
    pub async fn generate(&self, transcript: &str, date: &str, speakers: &str) -> Result<String> {
        let prompt = self.render_prompt(transcript, date, speakers);
        let max_attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(
                "Calling LLM (attempt {attempt}/{max_attempts}, model={})",
                self.model
            );

            match self.client.complete(&prompt).await {
                Ok(text) => {
                    if text.trim().is_empty() {
                        return Err(PipelineError::Generation(
                            "LLM returned empty content".to_string(),
                        ));
                    }
                    info!("LLM responded with {} chars", text.len());
                    return Ok(text);
                }
                Err(LlmError::RateLimited { retry_after }) => {
                    last_error = "rate limited".to_string();
                    if attempt < max_attempts {
                        let delay = retry_after.unwrap_or(1 << (attempt - 1));
                        warn!(
                            "Rate limited on attempt {attempt}/{max_attempts}, retrying in {delay}s"
                        );
                        sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                }
                Err(LlmError::Status { code, message }) if (500..600).contains(&code) => {
                    last_error = format!("HTTP {code}: {message}");
                    if attempt < max_attempts {
                        let delay = 1u64 << (attempt - 1);
                        warn!(
                            "LLM server error on attempt {attempt}/{max_attempts} (HTTP {code}), \
                             retrying in {delay}s"
                        );
                        sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                }
                Err(LlmError::Status { code, message }) => {
                    return Err(PipelineError::Generation(format!(
                        "LLM client error (HTTP {code}): {message}"
                    )));
                }
                Err(LlmError::Transport(message)) => {
                    last_error = message.clone();
                    if attempt < max_attempts {
                        let delay = 1u64 << (attempt - 1);
                        warn!(
                            "LLM transport error on attempt {attempt}/{max_attempts}: {message}, \
                             retrying in {delay}s"
                        );
                        sleep(Duration::from_secs(delay)).await;
                        continue;
                    }
                }
                Err(LlmError::InvalidResponse(message)) => {
                    return Err(PipelineError::Generation(format!(
                        "LLM response unparseable: {message}"
                    )));
                }
            }
        }

        Err(PipelineError::Generation(format!(
            "LLM failed after {max_attempts} attempts: {last_error}"
        )))
    }
}
