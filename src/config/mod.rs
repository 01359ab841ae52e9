//! Configuration: YAML document + `.env` secrets + `SECTION_KEY` env overrides.
//!
//! Precedence (highest wins): environment variables, YAML values, defaults.
//! The two secrets (bot token, LLM key) are taken exclusively from the
//! environment and never from the YAML document.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::errors::PipelineError;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chat: ChatConfig,
    pub source: SourceConfig,
    pub recognizer: RecognizerConfig,
    pub merger: MergerConfig,
    pub generator: GeneratorConfig,
    pub publisher: PublisherConfig,
    pub drive: DriveConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Channel the recording bot posts its panel in.
    pub watch_channel_id: u64,
    /// Channel minutes, status and error messages are published to.
    pub output_channel_id: u64,
    /// Role to mention on pipeline errors.
    pub error_mention_role_id: Option<u64>,
    /// Bot token; env-only (`DISCORD_BOT_TOKEN`).
    #[serde(skip)]
    pub bot_token: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            watch_channel_id: 0,
            output_channel_id: 0,
            error_mention_role_id: None,
            bot_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// User id of the recording bot whose panel edits we watch.
    pub bot_id: u64,
    /// Hosts accepted in recording URLs.
    pub domain_allowlist: Vec<String>,
    /// Audio format requested from the cook endpoint.
    pub format: String,
    /// Container requested from the cook endpoint.
    pub container: String,
    /// Combined cook+download deadline in seconds.
    pub download_timeout_sec: u64,
    /// Archive download retry count.
    pub max_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bot_id: 272_937_604_339_466_240,
            domain_allowlist: vec!["craig.chat".to_string(), "craig.horse".to_string()],
            format: "aac".to_string(),
            container: "zip".to_string(),
            download_timeout_sec: 300,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Model name (resolved under `models/`) or a direct path to a model file.
    pub model: String,
    pub language: String,
    pub device: String,
    pub compute_type: String,
    pub beam_size: u32,
    pub vad_filter: bool,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            model: "large-v3".to_string(),
            language: "ja".to_string(),
            device: "cuda".to_string(),
            compute_type: "float16".to_string(),
            beam_size: 5,
            vad_filter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    /// Gap below which consecutive same-speaker segments are coalesced.
    /// Zero disables coalescing.
    pub gap_merge_threshold_sec: f64,
    /// Segments shorter than this many characters are dropped.
    pub min_segment_chars: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            gap_merge_threshold_sec: 1.0,
            min_segment_chars: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub prompt_template_path: String,
    pub max_retries: u32,
    /// LLM key; env-only (`ANTHROPIC_API_KEY`).
    #[serde(skip)]
    pub api_key: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 4096,
            temperature: 0.3,
            prompt_template_path: "prompts/minutes.txt".to_string(),
            max_retries: 2,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub embed_color: u32,
    /// Upper bound for the embed description, in characters.
    pub max_embed_length: usize,
    /// Also attach the raw merged transcript to the final post.
    pub include_transcript: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            embed_color: 0x5865F2,
            max_embed_length: 4000,
            include_transcript: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub enabled: bool,
    pub folder_id: String,
    pub poll_interval_sec: u64,
    pub credentials_file: String,
    /// Glob the archive filenames must match.
    pub file_pattern: String,
    /// Persisted set of drive-file ids with terminal outcomes.
    pub processed_db_path: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            folder_id: String::new(),
            poll_interval_sec: 30,
            credentials_file: "credentials.json".to_string(),
            file_pattern: "craig_*.aac.zip".to_string(),
            processed_db_path: "processed_files.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
    /// Accepted for deployment tooling; rotation itself is external.
    pub max_bytes: u64,
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "logs/minutier.log".to_string(),
            max_bytes: 10_485_760,
            backup_count: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind_port: 3834 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long shutdown waits for in-flight pipelines.
    pub shutdown_grace_sec: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_sec: 600,
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML file plus the environment.
    ///
    /// A `.env` file in the working directory is loaded first (existing
    /// environment variables win). `SECTION_KEY` variables override YAML
    /// values; the two secrets come only from the environment.
    pub fn load(config_path: &Path) -> Result<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(anyhow::anyhow!(err)).context("Failed to read .env file");
            }
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;

        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;

        config.apply_env_overrides()?;

        config.chat.bot_token = std::env::var("DISCORD_BOT_TOKEN")
            .or_else(|_| std::env::var("DISCORD_TOKEN"))
            .unwrap_or_default();
        config.generator.api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();

        config.validate().map_err(anyhow::Error::new)?;

        info!("Configuration loaded from {}", config_path.display());
        Ok(config)
    }

    /// Apply `SECTION_KEY` environment overrides onto YAML/default values.
    fn apply_env_overrides(&mut self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        override_parse(&mut self.chat.watch_channel_id, "CHAT_WATCH_CHANNEL_ID", &mut errors);
        override_parse(&mut self.chat.output_channel_id, "CHAT_OUTPUT_CHANNEL_ID", &mut errors);
        override_opt_parse(
            &mut self.chat.error_mention_role_id,
            "CHAT_ERROR_MENTION_ROLE_ID",
            &mut errors,
        );

        override_parse(&mut self.source.bot_id, "SOURCE_BOT_ID", &mut errors);
        override_list(&mut self.source.domain_allowlist, "SOURCE_DOMAIN_ALLOWLIST");
        override_string(&mut self.source.format, "SOURCE_FORMAT");
        override_string(&mut self.source.container, "SOURCE_CONTAINER");
        override_parse(&mut self.source.download_timeout_sec, "SOURCE_DOWNLOAD_TIMEOUT_SEC", &mut errors);
        override_parse(&mut self.source.max_retries, "SOURCE_MAX_RETRIES", &mut errors);

        override_string(&mut self.recognizer.model, "RECOGNIZER_MODEL");
        override_string(&mut self.recognizer.language, "RECOGNIZER_LANGUAGE");
        override_string(&mut self.recognizer.device, "RECOGNIZER_DEVICE");
        override_string(&mut self.recognizer.compute_type, "RECOGNIZER_COMPUTE_TYPE");
        override_parse(&mut self.recognizer.beam_size, "RECOGNIZER_BEAM_SIZE", &mut errors);
        override_bool(&mut self.recognizer.vad_filter, "RECOGNIZER_VAD_FILTER");

        override_parse(
            &mut self.merger.gap_merge_threshold_sec,
            "MERGER_GAP_MERGE_THRESHOLD_SEC",
            &mut errors,
        );
        override_parse(&mut self.merger.min_segment_chars, "MERGER_MIN_SEGMENT_CHARS", &mut errors);

        override_string(&mut self.generator.model, "GENERATOR_MODEL");
        override_parse(&mut self.generator.max_tokens, "GENERATOR_MAX_TOKENS", &mut errors);
        override_parse(&mut self.generator.temperature, "GENERATOR_TEMPERATURE", &mut errors);
        override_string(&mut self.generator.prompt_template_path, "GENERATOR_PROMPT_TEMPLATE_PATH");
        override_parse(&mut self.generator.max_retries, "GENERATOR_MAX_RETRIES", &mut errors);

        override_color(&mut self.publisher.embed_color, "PUBLISHER_EMBED_COLOR", &mut errors);
        override_parse(&mut self.publisher.max_embed_length, "PUBLISHER_MAX_EMBED_LENGTH", &mut errors);
        override_bool(&mut self.publisher.include_transcript, "PUBLISHER_INCLUDE_TRANSCRIPT");

        override_bool(&mut self.drive.enabled, "DRIVE_ENABLED");
        override_string(&mut self.drive.folder_id, "DRIVE_FOLDER_ID");
        override_parse(&mut self.drive.poll_interval_sec, "DRIVE_POLL_INTERVAL_SEC", &mut errors);
        override_string(&mut self.drive.credentials_file, "DRIVE_CREDENTIALS_FILE");
        override_string(&mut self.drive.file_pattern, "DRIVE_FILE_PATTERN");
        override_string(&mut self.drive.processed_db_path, "DRIVE_PROCESSED_DB_PATH");

        override_string(&mut self.logging.level, "LOGGING_LEVEL");
        override_string(&mut self.logging.file, "LOGGING_FILE");
        override_parse(&mut self.logging.max_bytes, "LOGGING_MAX_BYTES", &mut errors);
        override_parse(&mut self.logging.backup_count, "LOGGING_BACKUP_COUNT", &mut errors);

        override_parse(&mut self.api.bind_port, "API_BIND_PORT", &mut errors);
        override_parse(
            &mut self.pipeline.shutdown_grace_sec,
            "PIPELINE_SHUTDOWN_GRACE_SEC",
            &mut errors,
        );

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Invalid environment override(s):\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    /// Validate the assembled configuration, collecting every problem.
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        let mut errors: Vec<String> = Vec::new();

        if self.chat.bot_token.is_empty() {
            errors.push("chat bot token is required (set DISCORD_BOT_TOKEN in the environment)".into());
        }
        if self.chat.watch_channel_id == 0 {
            errors.push("chat.watch_channel_id must be a positive integer".into());
        }
        if self.chat.output_channel_id == 0 {
            errors.push("chat.output_channel_id must be a positive integer".into());
        }

        if self.source.bot_id == 0 {
            errors.push("source.bot_id must be a positive integer".into());
        }
        if self.source.domain_allowlist.is_empty() {
            errors.push("source.domain_allowlist must list at least one host".into());
        }
        if self.source.download_timeout_sec == 0 {
            errors.push("source.download_timeout_sec must be >= 1".into());
        }

        if self.recognizer.model.is_empty() {
            errors.push("recognizer.model must not be empty".into());
        }
        if self.recognizer.beam_size == 0 {
            errors.push("recognizer.beam_size must be >= 1".into());
        }

        if self.merger.gap_merge_threshold_sec < 0.0 {
            errors.push("merger.gap_merge_threshold_sec must be >= 0".into());
        }

        if self.generator.api_key.is_empty() {
            errors.push("generator API key is required (set ANTHROPIC_API_KEY in the environment)".into());
        }
        if !(0.0..=1.0).contains(&self.generator.temperature) {
            errors.push("generator.temperature must be between 0.0 and 1.0".into());
        }
        if self.generator.max_tokens == 0 {
            errors.push("generator.max_tokens must be >= 1".into());
        }

        if self.publisher.max_embed_length == 0 {
            errors.push("publisher.max_embed_length must be >= 1".into());
        }

        if self.drive.enabled {
            if self.drive.folder_id.is_empty() {
                errors.push("drive.folder_id is required when drive.enabled is true".into());
            }
            if self.drive.poll_interval_sec < 5 {
                errors.push("drive.poll_interval_sec must be >= 5".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn override_string(target: &mut String, key: &str) {
    if let Ok(value) = std::env::var(key) {
        *target = value;
    }
}

fn override_list(target: &mut Vec<String>, key: &str) {
    if let Ok(value) = std::env::var(key) {
        *target = value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

fn override_bool(target: &mut bool, key: &str) {
    if let Ok(value) = std::env::var(key) {
        *target = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
    }
}

fn override_parse<T>(target: &mut T, key: &str, errors: &mut Vec<String>)
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(key) {
        match value.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(err) => errors.push(format!("{key}={value}: {err}")),
        }
    }
}

fn override_opt_parse<T>(target: &mut Option<T>, key: &str, errors: &mut Vec<String>)
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(key) {
        if value.is_empty() {
            *target = None;
            return;
        }
        match value.parse::<T>() {
            Ok(parsed) => *target = Some(parsed),
            Err(err) => errors.push(format!("{key}={value}: {err}")),
        }
    }
}

/// Color overrides accept both decimal and `0x`-prefixed hex.
fn override_color(target: &mut u32, key: &str, errors: &mut Vec<String>) {
    if let Ok(value) = std::env::var(key) {
        let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            value.parse::<u32>()
        };
        match parsed {
            Ok(color) => *target = color,
            Err(err) => errors.push(format!("{key}={value}: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
chat:
  watch_channel_id: 111
  output_channel_id: 222
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.chat.watch_channel_id, 111);
        assert_eq!(config.source.format, "aac");
        assert_eq!(config.source.download_timeout_sec, 300);
        assert_eq!(config.merger.gap_merge_threshold_sec, 1.0);
        assert_eq!(config.drive.poll_interval_sec, 30);
        assert!(!config.drive.enabled);
    }

    #[test]
    fn validation_collects_all_problems() {
        let mut config = Config::default();
        config.generator.temperature = 3.0;
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("watch_channel_id"));
        assert!(message.contains("temperature"));
        assert!(message.contains("DISCORD_BOT_TOKEN"));
    }

    #[test]
    fn drive_validation_only_when_enabled() {
        let mut config = Config::default();
        config.chat.bot_token = "t".into();
        config.chat.watch_channel_id = 1;
        config.chat.output_channel_id = 2;
        config.generator.api_key = "k".into();
        assert!(config.validate().is_ok());

        config.drive.enabled = true;
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("drive.folder_id"));
    }

    #[test]
    fn same_document_parses_equal() {
        let a: Config = serde_yaml::from_str(MINIMAL).unwrap();
        let b: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn env_override_wins_over_yaml() {
        std::env::set_var("MERGER_GAP_MERGE_THRESHOLD_SEC", "2.5");
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("MERGER_GAP_MERGE_THRESHOLD_SEC");
        assert_eq!(config.merger.gap_merge_threshold_sec, 2.5);
    }

    #[test]
    fn color_override_accepts_hex() {
        let mut errors = Vec::new();
        std::env::set_var("TEST_EMBED_COLOR", "0xFF0000");
        let mut color = 0u32;
        override_color(&mut color, "TEST_EMBED_COLOR", &mut errors);
        std::env::remove_var("TEST_EMBED_COLOR");
        assert_eq!(color, 0xFF0000);
        assert!(errors.is_empty());
    }

    #[test]
    fn invalid_override_reports_key() {
        let mut errors = Vec::new();
        std::env::set_var("TEST_MAX_RETRIES", "many");
        let mut retries = 2u32;
        override_parse(&mut retries, "TEST_MAX_RETRIES", &mut errors);
        std::env::remove_var("TEST_MAX_RETRIES");
        assert_eq!(retries, 2);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("TEST_MAX_RETRIES"));
    }
}
