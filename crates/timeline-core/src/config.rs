//! Environment-backed runtime configuration for room timelines.

use std::env;

use thiserror::Error;

use crate::{pagination::bounded_paginate_limit, retry::RetryPolicy};

const DEFAULT_PAGINATE_LIMIT: u16 = 30;
const DEFAULT_PAGINATION_LIMIT_CAP: u16 = 100;
const DEFAULT_SEND_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_COMMAND_BUFFER: usize = 128;
const DEFAULT_UPDATE_BUFFER: usize = 256;

/// Tuning shared by every room timeline of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineConfig {
    /// Page size used when a caller does not ask for one.
    pub paginate_limit: u16,
    /// Server-side cap on page size.
    pub pagination_limit_cap: u16,
    /// Transport attempts per send before the echo is marked failed.
    pub send_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Per-room command queue capacity.
    pub command_buffer: usize,
    /// Broadcast capacity for timeline updates.
    pub update_buffer: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            paginate_limit: DEFAULT_PAGINATE_LIMIT,
            pagination_limit_cap: DEFAULT_PAGINATION_LIMIT_CAP,
            send_max_attempts: DEFAULT_SEND_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            update_buffer: DEFAULT_UPDATE_BUFFER,
        }
    }
}

impl TimelineConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let paginate_limit =
            parse_or("TIMELINE_PAGINATE_LIMIT", DEFAULT_PAGINATE_LIMIT, &mut lookup)?;
        let pagination_limit_cap = parse_or(
            "TIMELINE_PAGINATION_LIMIT_CAP",
            DEFAULT_PAGINATION_LIMIT_CAP,
            &mut lookup,
        )?;
        let send_max_attempts = parse_or(
            "TIMELINE_SEND_MAX_ATTEMPTS",
            DEFAULT_SEND_MAX_ATTEMPTS,
            &mut lookup,
        )?;
        let retry_base_delay_ms = parse_or(
            "TIMELINE_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let retry_max_delay_ms = parse_or(
            "TIMELINE_RETRY_MAX_DELAY_MS",
            DEFAULT_RETRY_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let command_buffer =
            parse_or("TIMELINE_COMMAND_BUFFER", DEFAULT_COMMAND_BUFFER, &mut lookup)?;
        let update_buffer = parse_or("TIMELINE_UPDATE_BUFFER", DEFAULT_UPDATE_BUFFER, &mut lookup)?;

        ensure_at_least_one("TIMELINE_PAGINATE_LIMIT", u64::from(paginate_limit))?;
        ensure_at_least_one("TIMELINE_PAGINATION_LIMIT_CAP", u64::from(pagination_limit_cap))?;
        ensure_at_least_one("TIMELINE_SEND_MAX_ATTEMPTS", u64::from(send_max_attempts))?;
        ensure_at_least_one("TIMELINE_COMMAND_BUFFER", command_buffer as u64)?;
        ensure_at_least_one("TIMELINE_UPDATE_BUFFER", update_buffer as u64)?;
        if retry_max_delay_ms < retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "TIMELINE_RETRY_MAX_DELAY_MS",
                value: retry_max_delay_ms.to_string(),
                reason: format!("must be at least TIMELINE_RETRY_BASE_DELAY_MS ({retry_base_delay_ms})"),
            });
        }

        Ok(Self {
            paginate_limit,
            pagination_limit_cap,
            send_max_attempts,
            retry_base_delay_ms,
            retry_max_delay_ms,
            command_buffer,
            update_buffer,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.send_max_attempts,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }

    /// Page size for a request, defaulting and clamping against the server cap.
    pub fn bounded_limit(&self, requested: Option<u16>) -> u16 {
        bounded_paginate_limit(
            requested.unwrap_or(self.paginate_limit),
            self.pagination_limit_cap,
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn ensure_at_least_one(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}
