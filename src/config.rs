//! Environment-driven configuration
//!
//! Loaded once at process start and passed down explicitly. Missing
//! database or model credentials are fatal.

use crate::error::OrchestrationError;
use crate::memory::DEFAULT_MAX_SESSIONS;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_CURRENCY: &str = "₱";

/// Bounds applied to a single conversation turn
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    pub max_rounds: u32,
    pub oracle_timeout: Duration,
    pub operation_timeout: Duration,
    pub turn_deadline: Duration,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            oracle_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            turn_deadline: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database_url: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub currency: String,
    pub port: u16,
    /// Sessions the API keeps in memory before evicting idle ones
    pub max_sessions: usize,
    pub limits: LoopLimits,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            gemini_api_key: String::new(),
            gemini_model: DEFAULT_MODEL.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
            port: 8080,
            max_sessions: DEFAULT_MAX_SESSIONS,
            limits: LoopLimits::default(),
        }
    }
}

impl AgentConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like `from_env`, but a database URL is optional. For runs backed by
    /// the in-memory store.
    pub fn from_env_without_database() -> Result<Self> {
        Self::load(|key| env::var(key).ok(), false)
    }

    /// Build configuration from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load(lookup, true)
    }

    fn load<F>(lookup: F, database_required: bool) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = match non_empty("DATABASE_URL").or_else(|| non_empty("POSTGRES_URL")) {
            Some(url) => url,
            None if database_required => {
                return Err(OrchestrationError::ConfigError(
                    "DATABASE_URL not set in environment variables".to_string(),
                ))
            }
            None => String::new(),
        };

        let gemini_api_key = non_empty("GEMINI_API_KEY").ok_or_else(|| {
            OrchestrationError::ConfigError(
                "GEMINI_API_KEY not set in environment variables".to_string(),
            )
        })?;

        let port_raw = non_empty("PORT").or_else(|| non_empty("API_PORT"));

        Ok(Self {
            database_url,
            gemini_api_key,
            gemini_model: non_empty("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            currency: non_empty("CURRENCY_SYMBOL").unwrap_or(defaults.currency),
            port: parse_or("PORT", port_raw, defaults.port)?,
            max_sessions: parse_or("MAX_SESSIONS", non_empty("MAX_SESSIONS"), defaults.max_sessions)?,
            limits: LoopLimits {
                max_rounds: parse_or(
                    "AGENT_MAX_ROUNDS",
                    non_empty("AGENT_MAX_ROUNDS"),
                    defaults.limits.max_rounds,
                )?,
                oracle_timeout: secs_or(
                    "ORACLE_TIMEOUT_SECS",
                    non_empty("ORACLE_TIMEOUT_SECS"),
                    defaults.limits.oracle_timeout,
                )?,
                operation_timeout: secs_or(
                    "OPERATION_TIMEOUT_SECS",
                    non_empty("OPERATION_TIMEOUT_SECS"),
                    defaults.limits.operation_timeout,
                )?,
                turn_deadline: secs_or(
                    "TURN_DEADLINE_SECS",
                    non_empty("TURN_DEADLINE_SECS"),
                    defaults.limits.turn_deadline,
                )?,
            },
        })
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(value) => value.trim().parse().map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has an invalid value: {}", key, value))
        }),
        None => Ok(default),
    }
}

fn secs_or(key: &str, raw: Option<String>, default: Duration) -> Result<Duration> {
    parse_or(key, raw, default.as_secs()).map(Duration::from_secs)
}
