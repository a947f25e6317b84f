//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Free-tier limits. Premium users are never gated by these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaLimits {
    pub monthly_requests: i64,
    pub plagiarism_checks: i64,
    pub documents: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            monthly_requests: 50,
            plagiarism_checks: 5,
            documents: 10,
        }
    }
}

/// Tunables for the conversation pipeline.
#[derive(Clone, Debug)]
pub struct ChatSettings {
    pub recent_context_limit: usize,
    pub document_excerpt_chars: usize,
    pub max_message_chars: usize,
    pub generation_timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            recent_context_limit: 5,
            document_excerpt_chars: 3000,
            max_message_chars: 2000,
            generation_timeout: Duration::from_secs(60),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` runs the service against the in-memory store.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub jwt_secret: String,
    pub openai_api_key: Option<String>,
    pub generation_model: String,
    pub client_origin: String,
    pub quota: QuotaLimits,
    pub chat: ChatSettings,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Secrets ---
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| ConfigError::MissingVar("JWT_SECRET".to_string()))?;
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();

        // --- Load Adapter-specific Settings ---
        let generation_model =
            std::env::var("GENERATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let client_origin = std::env::var("CLIENT_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        // --- Load Quota and Pipeline Settings ---
        let defaults = QuotaLimits::default();
        let quota = QuotaLimits {
            monthly_requests: parse_var("FREE_TIER_REQUESTS_PER_MONTH", defaults.monthly_requests)?,
            plagiarism_checks: parse_var("FREE_TIER_PLAGIARISM_CHECKS", defaults.plagiarism_checks)?,
            documents: parse_var("FREE_TIER_DOCUMENTS", defaults.documents)?,
        };

        let chat_defaults = ChatSettings::default();
        let chat = ChatSettings {
            recent_context_limit: parse_var("RECENT_CONTEXT_LIMIT", chat_defaults.recent_context_limit)?,
            document_excerpt_chars: parse_var("DOCUMENT_EXCERPT_CHARS", chat_defaults.document_excerpt_chars)?,
            max_message_chars: parse_var("MAX_MESSAGE_CHARS", chat_defaults.max_message_chars)?,
            generation_timeout: Duration::from_secs(parse_var(
                "GENERATION_TIMEOUT_SECS",
                chat_defaults.generation_timeout.as_secs(),
            )?),
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            jwt_secret,
            openai_api_key,
            generation_model,
            client_origin,
            quota,
            chat,
        })
    }
}

/// Reads an optional numeric variable, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
