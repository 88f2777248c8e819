//! Configuration for webhook verification, retries and deduplication.

use super::retry::RetryPolicy;
use super::verification::SignatureAlgorithm;
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Signature verification and endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret provisioned by the provider
    #[serde(default)]
    pub secret: Option<SecretString>,

    /// Digest algorithm expected in the signature header
    #[serde(default)]
    pub algorithm: SignatureAlgorithm,

    /// Maximum allowed distance between signature timestamp and now, in seconds
    #[serde(default = "default_tolerance_seconds")]
    pub tolerance_seconds: u64,

    /// Request header carrying the signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// Route the receiver is mounted on
    #[serde(default = "default_path")]
    pub path: String,

    /// Overall processing deadline in seconds, 0 disables it
    #[serde(default)]
    pub deadline_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            algorithm: SignatureAlgorithm::default(),
            tolerance_seconds: default_tolerance_seconds(),
            signature_header: default_signature_header(),
            path: default_path(),
            deadline_seconds: 0,
        }
    }
}

impl WebhookConfig {
    /// Load webhook configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields that are set in the environment, keeping the rest
    pub fn apply_env(&mut self) {
        let config = self;

        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            config.secret = Some(SecretString::from(secret));
        }

        if let Some(algorithm) = parse_env_with_prefix("WEBHOOK_ALGORITHM") {
            config.algorithm = algorithm;
        }

        if let Some(tolerance) = parse_env_with_prefix("WEBHOOK_TOLERANCE_SECONDS") {
            config.tolerance_seconds = tolerance;
        }

        if let Some(header) = get_env_with_prefix("WEBHOOK_SIGNATURE_HEADER") {
            config.signature_header = header;
        }

        if let Some(path) = get_env_with_prefix("WEBHOOK_PATH") {
            config.path = path;
        }

        if let Some(deadline) = parse_env_with_prefix("WEBHOOK_DEADLINE_SECONDS") {
            config.deadline_seconds = deadline;
        }
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_seconds)
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_seconds > 0).then(|| Duration::from_secs(self.deadline_seconds))
    }
}

/// Backoff settings for the business callback
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Load retry configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields that are set in the environment, keeping the rest
    pub fn apply_env(&mut self) {
        let config = self;

        if let Some(retries) = parse_env_with_prefix("RETRY_MAX_RETRIES") {
            config.max_retries = retries;
        }

        if let Some(base) = parse_env_with_prefix("RETRY_BASE_DELAY_MS") {
            config.base_delay_ms = base;
        }

        if let Some(max) = parse_env_with_prefix("RETRY_MAX_DELAY_MS") {
            config.max_delay_ms = max;
        }

        if let Some(multiplier) = parse_env_with_prefix("RETRY_BACKOFF_MULTIPLIER") {
            config.backoff_multiplier = multiplier;
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(self.clone())
    }
}

/// Retention settings for the dedup cache
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DedupConfig {
    /// How long processed event results are served to redeliveries
    #[serde(default = "default_dedup_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Age after which an unfinished claim is treated as abandoned
    #[serde(default = "default_claim_ttl_seconds")]
    pub claim_ttl_seconds: u64,

    /// Interval of the background purge task, 0 disables it
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_dedup_ttl_seconds(),
            claim_ttl_seconds: default_claim_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl DedupConfig {
    /// Load dedup configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields that are set in the environment, keeping the rest
    pub fn apply_env(&mut self) {
        let config = self;

        if let Some(ttl) = parse_env_with_prefix("DEDUP_TTL_SECONDS") {
            config.ttl_seconds = ttl;
        }

        if let Some(ttl) = parse_env_with_prefix("DEDUP_CLAIM_TTL_SECONDS") {
            config.claim_ttl_seconds = ttl;
        }

        if let Some(interval) = parse_env_with_prefix("DEDUP_SWEEP_INTERVAL_SECONDS") {
            config.sweep_interval_seconds = interval;
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_seconds > 0).then(|| Duration::from_secs(self.sweep_interval_seconds))
    }
}

fn default_tolerance_seconds() -> u64 {
    300
}

fn default_signature_header() -> String {
    "X-Signature".to_string()
}

fn default_path() -> String {
    "/webhooks".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_dedup_ttl_seconds() -> u64 {
    86_400 // 24 hours
}

fn default_claim_ttl_seconds() -> u64 {
    300
}

fn default_sweep_interval_seconds() -> u64 {
    3_600
}
