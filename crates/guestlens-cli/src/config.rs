use anyhow::{Context, Result};
use guestlens_studio::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration: defaults, then an optional TOML file, then
/// `GUESTLENS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// URL of the studio endpoint every action is posted to.
    pub endpoint_url: Option<String>,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Where missing model files are downloaded from.
    pub model_base_url: Option<String>,
    /// Directory holding the guest session database.
    pub data_dir: PathBuf,
    /// Euclidean distance below which two faces are the same person.
    pub match_threshold: f32,
    /// Detector confidence below which faces are ignored.
    pub min_confidence: f32,
    pub request_timeout_secs: u64,
    pub event_retry_attempts: u32,
    pub event_retry_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("guestlens");

        Self {
            endpoint_url: None,
            model_dir: guestlens_core::default_model_dir(),
            model_base_url: None,
            data_dir,
            match_threshold: guestlens_core::DEFAULT_MATCH_THRESHOLD,
            min_confidence: guestlens_core::DEFAULT_MIN_CONFIDENCE,
            request_timeout_secs: 30,
            event_retry_attempts: 3,
            event_retry_delay_ms: 2000,
        }
    }
}

impl Config {
    /// Load the configuration, reading `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with(path: Option<&Path>, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(var);
        Ok(config)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("GUESTLENS_ENDPOINT_URL") {
            self.endpoint_url = Some(v);
        }
        if let Some(v) = var("GUESTLENS_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("GUESTLENS_MODEL_BASE_URL") {
            self.model_base_url = Some(v);
        }
        if let Some(v) = var("GUESTLENS_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        override_parsed(&var, "GUESTLENS_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&var, "GUESTLENS_MIN_CONFIDENCE", &mut self.min_confidence);
        override_parsed(&var, "GUESTLENS_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        override_parsed(&var, "GUESTLENS_EVENT_RETRY_ATTEMPTS", &mut self.event_retry_attempts);
        override_parsed(&var, "GUESTLENS_EVENT_RETRY_DELAY_MS", &mut self.event_retry_delay_ms);
    }

    pub fn endpoint_url(&self) -> Result<&str> {
        self.endpoint_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .context("no studio endpoint configured (set GUESTLENS_ENDPOINT_URL or endpoint_url)")
    }

    /// Path to the guest session database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("guestlens.db")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.event_retry_attempts,
            delay: Duration::from_millis(self.event_retry_delay_ms),
        }
    }
}

/// Replace `target` with the parsed value of `key`; unparsable values are
/// ignored with a warning.
fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = var(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}
