use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Google API endpoints and client behavior. Endpoints are overridable so
/// tests and self-hosted proxies can point at a different base URL.
#[derive(Debug, Deserialize, Clone)]
pub struct GoogleConfig {
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_gmail_endpoint")]
    pub gmail_endpoint: String,
    #[serde(default = "default_drive_endpoint")]
    pub drive_endpoint: String,
    #[serde(default = "default_drive_upload_endpoint")]
    pub drive_upload_endpoint: String,
    #[serde(default = "default_google_timeout_secs")]
    pub timeout_secs: u64,
    /// Access tokens expiring within this many seconds are refreshed
    /// before the run touches any provider API.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: i64,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            token_endpoint: default_token_endpoint(),
            gmail_endpoint: default_gmail_endpoint(),
            drive_endpoint: default_drive_endpoint(),
            drive_upload_endpoint: default_drive_upload_endpoint(),
            timeout_secs: default_google_timeout_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
        }
    }
}

fn default_token_endpoint() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_gmail_endpoint() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}
fn default_drive_endpoint() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_drive_upload_endpoint() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}
fn default_google_timeout_secs() -> u64 {
    30
}
fn default_refresh_margin_secs() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// `"openai"` or `"disabled"`. Disabled means every attachment is
    /// classified with the local heuristic only.
    #[serde(default = "default_classifier_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
    /// Content excerpt passed to the model is truncated to this many
    /// characters to bound request size.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    /// Completion token cap for the classification response.
    #[serde(default = "default_response_tokens")]
    pub max_response_tokens: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_classifier_provider(),
            model: None,
            endpoint: default_classifier_endpoint(),
            max_retries: default_max_retries(),
            timeout_secs: default_classifier_timeout_secs(),
            excerpt_chars: default_excerpt_chars(),
            max_response_tokens: default_response_tokens(),
        }
    }
}

fn default_classifier_provider() -> String {
    "disabled".to_string()
}
fn default_classifier_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_classifier_timeout_secs() -> u64 {
    30
}
fn default_excerpt_chars() -> usize {
    500
}
fn default_response_tokens() -> u32 {
    500
}

impl ClassifierConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Messages scanned per user per run. Messages beyond the cap are
    /// picked up by the next scheduled run.
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    /// Lookback window for a user's first run, before any ledger
    /// checkpoint exists.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    /// Name of the root folder created in the storage destination.
    #[serde(default = "default_root_folder")]
    pub root_folder: String,
    /// Label added to a message after its attachments are filed.
    /// Advisory only; re-adding is idempotent on the provider side.
    #[serde(default = "default_processed_label")]
    pub processed_label_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            lookback_hours: default_lookback_hours(),
            root_folder: default_root_folder(),
            processed_label_id: default_processed_label(),
        }
    }
}

fn default_max_messages() -> u32 {
    50
}
fn default_lookback_hours() -> i64 {
    24
}
fn default_root_folder() -> String {
    "Attachment Autopilot".to_string()
}
fn default_processed_label() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pipeline.max_messages == 0 {
        anyhow::bail!("pipeline.max_messages must be > 0");
    }

    if config.pipeline.lookback_hours <= 0 {
        anyhow::bail!("pipeline.lookback_hours must be > 0");
    }

    if config.pipeline.root_folder.trim().is_empty() {
        anyhow::bail!("pipeline.root_folder must not be empty");
    }

    match config.classifier.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown classifier provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.classifier.is_enabled() && config.classifier.model.is_none() {
        anyhow::bail!(
            "classifier.model must be specified when provider is '{}'",
            config.classifier.provider
        );
    }

    Ok(config)
}
