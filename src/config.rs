use crate::live::wire::ResponseModality;
use tracing::Level;

/// Default Gemini Live model, matching what the token issuer constrains
/// ephemeral tokens to.
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Default BidiGenerateContent WebSocket endpoint (v1alpha, required for
/// native-audio models).
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Immutable per-session settings sent in the Setup message.
///
/// Changing any field mid-session is not supported by the protocol; the
/// session must be torn down and reconnected with a new `SessionConfig`.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub model: String,
    pub system_instruction: Option<String>,
    pub voice_name: String,
    pub response_modalities: Vec<ResponseModality>,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub live_endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
    /// Raw API key; used directly when no token endpoint is configured.
    pub gemini_api_key: Option<String>,
    /// Ephemeral-token issuer URL. Preferred over the raw key when set.
    pub token_endpoint: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let live_endpoint =
            std::env::var("LIVE_ENDPOINT").unwrap_or_else(|_| DEFAULT_LIVE_ENDPOINT.to_string());
        let model = std::env::var("LIVE_MODEL").unwrap_or_else(|_| DEFAULT_LIVE_MODEL.to_string());
        let voice_name = std::env::var("VOICE_NAME").unwrap_or_else(|_| "Aoede".to_string());
        let system_instruction = std::env::var("SYSTEM_INSTRUCTION").ok();

        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();
        let token_endpoint = std::env::var("TOKEN_ENDPOINT").ok();
        if gemini_api_key.is_none() && token_endpoint.is_none() {
            return Err(ConfigError::MissingVar(
                "GEMINI_API_KEY or TOKEN_ENDPOINT must be set".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            live_endpoint,
            model,
            voice_name,
            system_instruction,
            gemini_api_key,
            token_endpoint,
            log_level,
        })
    }

    /// Derives the immutable per-session settings from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            system_instruction: self.system_instruction.clone(),
            voice_name: self.voice_name.clone(),
            response_modalities: vec![ResponseModality::Audio],
        }
    }
}
