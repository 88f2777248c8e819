use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, TidehookError};
use crate::utils::get_env_with_prefix;
use crate::webhooks::{
    DedupConfig, RetryConfig, SignatureAlgorithm, SignatureVerifier, WebhookConfig,
};

/// Main configuration for the webhook layer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

impl Config {
    /// Build a signature verifier from the webhook section.
    ///
    /// Fails when no secret is configured.
    pub fn signature_verifier(&self) -> Result<SignatureVerifier> {
        let secret = self
            .webhook
            .secret
            .clone()
            .ok_or_else(|| TidehookError::config("webhook secret is not configured"))?;

        Ok(SignatureVerifier::new(secret)
            .with_algorithm(self.webhook.algorithm)
            .with_tolerance(self.webhook.tolerance()))
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhook.secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.config.webhook.algorithm = algorithm;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.config.webhook.tolerance_seconds = tolerance.as_secs();
        self
    }

    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.config.webhook.signature_header = header.into();
        self
    }

    pub fn with_webhook_path(mut self, path: impl Into<String>) -> Self {
        self.config.webhook.path = path.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.config.webhook.deadline_seconds = deadline.as_secs();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.config.dedup = dedup;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.config.dedup.ttl_seconds = ttl.as_secs();
        self
    }

    /// Load configuration from environment variables
    /// Supports both TIDEHOOK_* prefixed and unprefixed variables
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }

        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        // Values set through with_* survive unless the environment overrides them
        self.config.webhook.apply_env();
        self.config.retry.apply_env();
        self.config.dedup.apply_env();

        self
    }

    /// Build the config, validating settings
    pub fn build(self) -> Result<Config> {
        let config = self.config;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(TidehookError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            )));
        }

        match &config.webhook.secret {
            Some(secret) if !secret.expose_secret().is_empty() => {}
            _ => {
                return Err(TidehookError::config(
                    "Webhook secret is required (set TIDEHOOK_WEBHOOK_SECRET or WEBHOOK_SECRET)",
                ));
            }
        }

        if config.webhook.signature_header.trim().is_empty() {
            return Err(TidehookError::config("Signature header name cannot be empty"));
        }

        if !config.webhook.path.starts_with('/') {
            return Err(TidehookError::config(format!(
                "Webhook path '{}' must start with '/'",
                config.webhook.path
            )));
        }

        let retry = &config.retry;
        if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier > 0.0) {
            return Err(TidehookError::config(format!(
                "Backoff multiplier must be a positive number, got {}",
                retry.backoff_multiplier
            )));
        }

        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(TidehookError::config(format!(
                "Base delay ({}ms) cannot exceed max delay ({}ms)",
                retry.base_delay_ms, retry.max_delay_ms
            )));
        }

        if config.dedup.ttl_seconds == 0 {
            return Err(TidehookError::config("Dedup TTL must be greater than 0"));
        }

        if config.dedup.claim_ttl_seconds == 0 {
            return Err(TidehookError::config("Claim TTL must be greater than 0"));
        }

        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
