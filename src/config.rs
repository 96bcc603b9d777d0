// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! `ClientConfig` carries the broker location, the exchange, and the retry,
//! prefetch and reconnection defaults. It can be built in code or loaded from
//! an optional `config/amqp` file and `AMQP_*` environment variables, nested
//! keys separated by `__` (for example `AMQP_RECONNECT__MAX_DELAY_MS`).

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
pub const DEFAULT_PREFETCH: u16 = 10;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Full broker URI. When set, the host/port/user/password/vhost fields are ignored.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    /// Name reported to the broker for this connection.
    pub connection_name: String,
    /// Bounded retries used by `connect_default` and lazy connections.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Prefetch used when `ConsumeOptions` doesn't set one.
    pub prefetch: u16,
    pub publisher_confirms: bool,
    /// Re-subscribe registered consumers after a reconnection.
    pub restore_consumers: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: None,
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            exchange: String::new(),
            connection_name: "amqp-suite".to_owned(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            prefetch: DEFAULT_PREFETCH,
            publisher_confirms: false,
            restore_consumers: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Reconnection after a broker-initiated close.
///
/// The default retries forever at the delay of the connect call that opened
/// the lost session. `max_delay_ms` turns the fixed delay into a doubling one
/// capped at that value; `max_attempts` stops the loop after that many
/// failed attempts.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay to wait after `current` before the next attempt.
    pub fn next_delay(&self, current: Duration) -> Duration {
        match self.max_delay_ms {
            Some(max) => current.saturating_mul(2).min(Duration::from_millis(max)),
            None => current,
        }
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts
            .is_some_and(|max| failed_attempts >= max)
    }
}

impl ClientConfig {
    pub fn new(url: &str, exchange: &str) -> ClientConfig {
        ClientConfig {
            url: Some(url.to_owned()),
            exchange: exchange.to_owned(),
            ..Default::default()
        }
    }

    /// Loads the configuration from `config/amqp.*` (optional) and `AMQP_*`
    /// environment variables, after reading a `.env` file if present.
    pub fn from_env() -> Result<ClientConfig, AmqpError> {
        dotenvy::dotenv().ok();

        let cfg = Config::builder()
            .add_source(File::with_name("config/amqp").required(false))
            .add_source(
                Environment::with_prefix("AMQP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: ClientConfig = cfg.try_deserialize()?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.exchange.is_empty() {
            return Err(AmqpError::ConfigError("exchange name is required".to_owned()));
        }

        if self.reconnect.max_delay_ms == Some(0) {
            return Err(AmqpError::ConfigError(
                "reconnect max delay must be positive".to_owned(),
            ));
        }

        Ok(())
    }

    /// Broker URI, built from the individual fields unless `url` is set.
    pub fn uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
