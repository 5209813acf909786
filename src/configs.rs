// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Typed configuration for the messaging layer. Values are read from the
//! process environment (optionally seeded from a `.env` file); anything unset
//! falls back to the defaults below.

use crate::errors::ConfigError;
use std::{env, str::FromStr, time::Duration};
use tracing::debug;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfigs {
    pub name: String,
    pub log_format: LogFormat,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "trip-messaging".to_owned(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Broker connection and consumer settings.
#[derive(Debug, Clone)]
pub struct RabbitMQConfigs {
    /// Full broker URL; takes precedence over the individual parts below.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Attempts made by the initial `connect()`.
    pub connect_attempts: u32,
    /// Base delay of the connection backoff.
    pub connect_delay: Duration,
    /// Attempts made after an unexpected connection loss.
    pub max_reconnect_attempts: u32,
    /// Upper bound of the exponential part of the connection backoff.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every connection backoff.
    pub jitter: Duration,
    /// Default per-consumer concurrency (prefetch).
    pub concurrency: u16,
    pub confirm_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            url: None,
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connect_attempts: 5,
            connect_delay: Duration::from_millis(1_000),
            max_reconnect_attempts: 10,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
            concurrency: 5,
            confirm_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RabbitMQConfigs {
    /// The AMQP URI used to open the connection.
    pub fn uri(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "amqp://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.vhost
            ),
        }
    }
}

/// Application-level retry settings for a job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfigs {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Republishes allowed to wait out their backoff at the same time.
    pub max_pending: usize,
}

impl Default for RetryConfigs {
    fn default() -> Self {
        RetryConfigs {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_pending: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub retry: RetryConfigs,
}

impl Configs {
    /// Reads the configuration from the environment.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    pub fn from_env() -> Result<Configs, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env file");
        }

        Configs::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Configs, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Configs::default();
        let rmq = defaults.rabbitmq;
        let retry = defaults.retry;

        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_owned(),
                value,
            })?,
            None => defaults.app.log_format,
        };

        Ok(Configs {
            app: AppConfigs {
                name: lookup("APP_NAME").unwrap_or(defaults.app.name),
                log_format,
            },
            rabbitmq: RabbitMQConfigs {
                url: lookup("RABBITMQ_URL"),
                host: lookup("RABBITMQ_HOST").unwrap_or(rmq.host),
                port: parse_or(&lookup, "RABBITMQ_PORT", rmq.port)?,
                user: lookup("RABBITMQ_USER").unwrap_or(rmq.user),
                password: lookup("RABBITMQ_PASSWORD").unwrap_or(rmq.password),
                vhost: lookup("RABBITMQ_VHOST").unwrap_or(rmq.vhost),
                connect_attempts: parse_or(
                    &lookup,
                    "RABBITMQ_CONNECT_ATTEMPTS",
                    rmq.connect_attempts,
                )?,
                connect_delay: millis_or(&lookup, "RABBITMQ_CONNECT_DELAY_MS", rmq.connect_delay)?,
                max_reconnect_attempts: parse_or(
                    &lookup,
                    "RABBITMQ_MAX_RECONNECT_ATTEMPTS",
                    rmq.max_reconnect_attempts,
                )?,
                max_delay: millis_or(&lookup, "RABBITMQ_MAX_DELAY_MS", rmq.max_delay)?,
                jitter: millis_or(&lookup, "RABBITMQ_JITTER_MS", rmq.jitter)?,
                concurrency: parse_or(&lookup, "RABBITMQ_CONCURRENCY", rmq.concurrency)?,
                confirm_timeout: millis_or(
                    &lookup,
                    "RABBITMQ_CONFIRM_TIMEOUT_MS",
                    rmq.confirm_timeout,
                )?,
                shutdown_timeout: millis_or(
                    &lookup,
                    "RABBITMQ_SHUTDOWN_TIMEOUT_MS",
                    rmq.shutdown_timeout,
                )?,
            },
            retry: RetryConfigs {
                max_retries: parse_or(&lookup, "JOB_MAX_RETRIES", retry.max_retries)?,
                base_delay: millis_or(&lookup, "JOB_RETRY_DELAY_MS", retry.base_delay)?,
                max_pending: parse_or(&lookup, "JOB_MAX_PENDING_RETRIES", retry.max_pending)?,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_owned(),
            value,
        }),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(_) => parse_or(lookup, key, 0u64).map(Duration::from_millis),
        None => Ok(default),
    }
}
