//! Typed settings, loaded once from the environment at startup.
//!
//! The teacher (`main.rs`) reads `std::env::var` ad hoc at the call site for
//! every flag (`MM_HARVEST_TICKS`, `MM_SHADOW_MODE`, `REDIS_URL`, ...). Here
//! every environment variable this pipeline needs is parsed exactly once
//! into `Settings`, validated eagerly, and threaded down as `Arc<Settings>` —
//! a bad credential or an out-of-range percentage fails at boot, not three
//! hours into a trading session.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub exchange_api_key: String,
    pub exchange_secret_key: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub chat_bot_token: String,
    pub chat_api_id: Option<String>,
    pub chat_api_hash: Option<String>,

    pub max_leverage: u32,
    pub max_position_percent: Decimal,
    pub default_risk_percent: Decimal,
    pub min_signal_confidence: Decimal,
    pub risk_management_disabled: bool,
    /// Mirrors the teacher's `MM_SHADOW_MODE` toggle: routes all order flow
    /// to the in-memory `SimExchangeClient` instead of the live venue.
    pub shadow_mode: bool,

    pub database_url: String,
    pub redis_url: String,

    pub worker_pool_size: usize,
    pub reconcile_interval_secs: u64,
    pub exchange_recv_window_ms: u64,
    pub llm_timeout_ms: u64,
    pub log_format: LogFormat,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_var_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_decimal_in_range(
    name: &'static str,
    value: &str,
    min: Decimal,
    max: Decimal,
) -> Result<Decimal, ConfigError> {
    let parsed: Decimal = value.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: "not a decimal number",
    })?;
    if parsed < min || parsed > max {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "out of range",
        });
    }
    Ok(parsed)
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_position_percent = parse_decimal_in_range(
            "MAX_POSITION_PERCENT",
            &env_var_or("MAX_POSITION_PERCENT", "20"),
            Decimal::ZERO,
            Decimal::ONE_HUNDRED,
        )?;
        let default_risk_percent = parse_decimal_in_range(
            "DEFAULT_RISK_PERCENT",
            &env_var_or("DEFAULT_RISK_PERCENT", "1"),
            Decimal::new(1, 1),
            Decimal::from(20),
        )?;
        let min_signal_confidence = parse_decimal_in_range(
            "MIN_SIGNAL_CONFIDENCE",
            &env_var_or("MIN_SIGNAL_CONFIDENCE", "0.8"),
            Decimal::ZERO,
            Decimal::ONE,
        )?;

        let max_leverage: u32 = env_var_or("MAX_LEVERAGE", "20")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "MAX_LEVERAGE",
                value: env_var_or("MAX_LEVERAGE", "20"),
                reason: "not an integer",
            })?;

        let risk_management_disabled = matches!(
            env_var_or("RISK_MANAGEMENT_DISABLED", "false").as_str(),
            "true" | "1"
        );
        let shadow_mode = matches!(env_var_or("SHADOW_MODE", "true").as_str(), "true" | "1");

        let log_format = match env_var_or("LOG_FORMAT", "pretty").as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            exchange_api_key: env_var("EXCHANGE_API_KEY")?,
            exchange_secret_key: env_var("EXCHANGE_SECRET_KEY")?,
            llm_api_key: env_var("LLM_API_KEY")?,
            llm_model: env_var_or("LLM_MODEL", "gpt-4o-mini"),
            chat_bot_token: env_var("CHAT_BOT_TOKEN")?,
            chat_api_id: std::env::var("CHAT_API_ID").ok(),
            chat_api_hash: std::env::var("CHAT_API_HASH").ok(),

            max_leverage,
            max_position_percent,
            default_risk_percent,
            min_signal_confidence,
            risk_management_disabled,
            shadow_mode,

            database_url: env_var("DATABASE_URL")?,
            redis_url: env_var_or("REDIS_URL", "redis://127.0.0.1:6379"),

            worker_pool_size: env_var_or("WORKER_POOL_SIZE", "4")
                .parse()
                .unwrap_or(4),
            reconcile_interval_secs: env_var_or("RECONCILE_INTERVAL_SECS", "30")
                .parse()
                .unwrap_or(30),
            exchange_recv_window_ms: env_var_or("EXCHANGE_RECV_WINDOW_MS", "5000")
                .parse()
                .unwrap_or(5000),
            llm_timeout_ms: env_var_or("LLM_TIMEOUT_MS", "15000")
                .parse()
                .unwrap_or(15000),
            log_format,
        })
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
