//! Configuration types for the companion client.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when `api.api_key` is not set.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Default delimiter between the header JSON and the body text of a turn.
pub const DEFAULT_SENTINEL: &str = "<<<AURA_BODY>>>";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuraConfig {
    /// Remote service endpoints and models.
    pub api: ApiConfig,
    /// Retry/backoff settings shared by every remote call.
    pub retry: RetryConfig,
    /// Streamed text turn settings.
    pub turn: TurnConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Live voice session settings.
    pub live: LiveConfig,
    /// Text-art rendering of generated images.
    pub render: RenderConfig,
}

/// Remote service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API key. Falls back to the `GEMINI_API_KEY` environment variable.
    pub api_key: Option<String>,
    /// REST base URL.
    pub base_url: String,
    /// Model used for streamed text turns.
    pub text_model: String,
    /// Model used for image generation.
    pub image_model: String,
    /// WebSocket endpoint of the bidirectional live service.
    pub live_url: String,
    /// Model used for live voice sessions.
    pub live_model: String,
    /// Per-request timeout in seconds (connect + response headers).
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com".to_owned(),
            text_model: "gemini-2.0-flash".to_owned(),
            image_model: "gemini-2.0-flash-preview-image-generation".to_owned(),
            live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            live_model: "models/gemini-2.0-flash-live-001".to_owned(),
            request_timeout_secs: 60,
        }
    }
}

impl ApiConfig {
    /// Resolve the API key from config, then the environment.
    ///
    /// # Errors
    ///
    /// Returns a config error when neither source provides a non-empty key.
    pub fn resolve_api_key(&self) -> crate::error::Result<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_owned());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                crate::error::AuraError::Config(format!(
                    "no API key: set api.api_key or {API_KEY_ENV}"
                ))
            })
    }
}

/// Retry/backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Build a [`RetryPolicy`] with the default transient-error predicate.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// Streamed text turn configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Literal token separating header JSON from body text.
    pub sentinel: String,
    /// Short persona description prepended to the system instruction.
    pub persona: String,
    /// Number of user/model exchanges kept as conversation history.
    pub max_history_turns: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_owned(),
            persona: "You are Aura, a warm and curious companion.".to_owned(),
            max_history_turns: 20,
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate sent to the live service, in Hz.
    pub input_sample_rate: u32,
    /// Sample rate of audio received from the live service, in Hz.
    pub output_sample_rate: u32,
    /// Samples per outbound frame (4096 at 16kHz = 256ms).
    pub frame_samples: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 4096,
            input_device: None,
            output_device: None,
        }
    }
}

/// Live voice session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Prebuilt voice used for spoken responses.
    pub voice_name: String,
    /// Optional system instruction for the voice session.
    pub system_instruction: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            voice_name: "Puck".to_owned(),
            system_instruction: None,
        }
    }
}

/// Text-art rendering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Output width in characters.
    pub columns: u32,
    /// Use a light-on-dark ramp (dense glyphs for bright pixels).
    pub invert: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            columns: 80,
            invert: false,
        }
    }
}

impl AuraConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::AuraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Serialize to pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> crate::error::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::error::AuraError::Config(e.to_string()))
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::AuraError;
        if self.turn.sentinel.is_empty() {
            return Err(AuraError::Config("turn.sentinel must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AuraError::Config("retry.max_attempts must be >= 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(AuraError::Config(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.audio.frame_samples == 0 {
            return Err(AuraError::Config("audio.frame_samples must be > 0".into()));
        }
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(AuraError::Config("audio sample rates must be > 0".into()));
        }
        Ok(())
    }

    /// Returns the default config file path: `<config_dir>/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::paths::config_dir().join("config.toml")
    }
}
