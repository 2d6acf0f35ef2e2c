//! Configuration module for Uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::notify::NotificationSettings;
use crate::probe::TargetPolicy;
use crate::scheduler::{EngineOptions, EngineSettings, Tuning};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the ops server; 0 disables it (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    pub max_concurrent: usize,
    pub tick_seconds: u64,
    pub jitter_percent: u32,
    pub jitter_max_seconds: u64,
    pub stats_log_seconds: u64,
    pub allow_private: bool,
    pub allow_loopback: bool,
    pub retry_interval_seconds: u64,
    pub tls_expiry_days: i64,
    pub shutdown_timeout_seconds: u64,
    pub telegram_chat_id: String,
    pub telegram_token: String,
    /// Emit JSON log lines instead of the human format.
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            max_concurrent: 16,
            tick_seconds: 1,
            jitter_percent: 10,
            jitter_max_seconds: 30,
            stats_log_seconds: 60,
            allow_private: false,
            allow_loopback: false,
            retry_interval_seconds: 20,
            tls_expiry_days: 14,
            shutdown_timeout_seconds: 10,
            telegram_chat_id: String::new(),
            telegram_token: String::new(),
            log_json: false,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring invalid config value"),
        }
    }
}

fn parse_bool(key: &str, target: &mut bool) {
    if let Ok(raw) = env::var(key) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" | "" => *target = false,
            _ => tracing::warn!(key, value = %raw, "Ignoring invalid config value"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is prefixed `UPTRAIL_`: `HTTP_PORT`, `DB_PATH`,
    /// `MAX_CONCURRENT`, `TICK_SECONDS`, `JITTER_PERCENT`, `JITTER_MAX_SECONDS`,
    /// `STATS_LOG_SECONDS`, `ALLOW_PRIVATE`, `ALLOW_LOOPBACK`,
    /// `RETRY_INTERVAL_SECONDS`, `TLS_EXPIRY_DAYS`, `SHUTDOWN_TIMEOUT_SECONDS`,
    /// `TELEGRAM_CHAT_ID`, `TELEGRAM_TOKEN`, `LOG_FORMAT` (`json`).
    /// Invalid values keep the default.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        parse_var("UPTRAIL_HTTP_PORT", &mut cfg.http_port);
        if let Ok(db_path) = env::var("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        parse_var("UPTRAIL_MAX_CONCURRENT", &mut cfg.max_concurrent);
        parse_var("UPTRAIL_TICK_SECONDS", &mut cfg.tick_seconds);
        parse_var("UPTRAIL_JITTER_PERCENT", &mut cfg.jitter_percent);
        parse_var("UPTRAIL_JITTER_MAX_SECONDS", &mut cfg.jitter_max_seconds);
        parse_var("UPTRAIL_STATS_LOG_SECONDS", &mut cfg.stats_log_seconds);
        parse_bool("UPTRAIL_ALLOW_PRIVATE", &mut cfg.allow_private);
        parse_bool("UPTRAIL_ALLOW_LOOPBACK", &mut cfg.allow_loopback);
        parse_var("UPTRAIL_RETRY_INTERVAL_SECONDS", &mut cfg.retry_interval_seconds);
        parse_var("UPTRAIL_TLS_EXPIRY_DAYS", &mut cfg.tls_expiry_days);
        parse_var("UPTRAIL_SHUTDOWN_TIMEOUT_SECONDS", &mut cfg.shutdown_timeout_seconds);
        if let Ok(chat_id) = env::var("UPTRAIL_TELEGRAM_CHAT_ID") {
            cfg.telegram_chat_id = chat_id.trim().to_string();
        }
        if let Ok(token) = env::var("UPTRAIL_TELEGRAM_TOKEN") {
            cfg.telegram_token = token.trim().to_string();
        }
        if let Ok(format) = env::var("UPTRAIL_LOG_FORMAT") {
            cfg.log_json = format.trim().eq_ignore_ascii_case("json");
        }

        if cfg.max_concurrent == 0 {
            cfg.max_concurrent = 1;
        }
        if cfg.tick_seconds == 0 {
            cfg.tick_seconds = 1;
        }
        cfg
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.telegram_chat_id.is_empty() && !self.telegram_token.is_empty()
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            jitter_percent: self.jitter_percent,
            jitter_max_seconds: self.jitter_max_seconds,
            stats_log_interval_seconds: self.stats_log_seconds,
        }
        .normalized()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            target_policy: TargetPolicy {
                allow_private: self.allow_private,
                allow_loopback: self.allow_loopback,
            },
            default_retry_interval: Duration::from_secs(self.retry_interval_seconds.max(1)),
            notifications: NotificationSettings {
                enabled: self.telegram_enabled(),
                token_ciphertext: self.telegram_token.clone(),
                chat_id: self.telegram_chat_id.clone(),
                tls_expiry_threshold_days: self.tls_expiry_days,
                ..Default::default()
            },
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_concurrent: self.max_concurrent,
            tick_interval: Duration::from_secs(self.tick_seconds),
            settings: self.engine_settings(),
            tuning: self.tuning(),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}
