//! Resolver tuning knobs.
//!
//! # Responsibility
//! - Hold the retry and lock-wait bounds used by `IdentityService`.
//! - Load overrides from process environment with strict parsing.
//!
//! # Invariants
//! - `max_attempts` is at least 1.
//! - Invalid environment values are rejected, never silently defaulted.

use std::time::Duration;
use thiserror::Error;

pub const MAX_ATTEMPTS_ENV: &str = "CONTACTLINK_MAX_ATTEMPTS";
pub const LOCK_TIMEOUT_MS_ENV: &str = "CONTACTLINK_LOCK_TIMEOUT_MS";

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Bounds for one `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Full attempts (lookup, lock, re-validate) before giving up on a
    /// cluster that keeps changing underneath the caller.
    pub max_attempts: u32,
    /// Longest wait for the cluster lock set in a single attempt.
    pub lock_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl ResolverConfig {
    /// Reads overrides from `CONTACTLINK_MAX_ATTEMPTS` and
    /// `CONTACTLINK_LOCK_TIMEOUT_MS`; unset or blank variables keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ResolverConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = non_blank(lookup(MAX_ATTEMPTS_ENV)) {
            let value = parse_u64(MAX_ATTEMPTS_ENV, &raw)?;
            config.max_attempts = u32::try_from(value)
                .ok()
                .filter(|attempts| *attempts > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: MAX_ATTEMPTS_ENV,
                    value: raw.clone(),
                    reason: "expected an integer between 1 and 4294967295",
                })?;
        }

        if let Some(raw) = non_blank(lookup(LOCK_TIMEOUT_MS_ENV)) {
            config.lock_timeout = Duration::from_millis(parse_u64(LOCK_TIMEOUT_MS_ENV, &raw)?);
        }

        Ok(config)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: "expected a non-negative integer",
    })
}
