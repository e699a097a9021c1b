// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::events::EventEncoding;
use crate::matching::MatchingConfig;
use crate::timer::TimerServiceConfig;

/// Kestrel Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL; `None` selects the in-memory backend
    pub database_url: Option<String>,
    /// Encoding of newly written history events
    pub event_encoding: EventEncoding,
    /// Matching partitions, ring and priority settings
    pub matching: MatchingConfig,
    /// Timer shards, scanning and processing
    pub timer: TimerServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            event_encoding: EventEncoding::Json,
            matching: MatchingConfig::default(),
            timer: TimerServiceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `KESTREL_DATABASE_URL`: SQLite URL (default: in-memory backend)
    /// - `KESTREL_EVENT_ENCODING`: `json` or `proto` (default: json)
    /// - `KESTREL_NUM_PARTITIONS`: matching partitions (default: 8)
    /// - `KESTREL_RING_REPLICAS`: ring points per partition (default: 64)
    /// - `KESTREL_PRIORITY_LEVELS`: priority levels per queue (default: 10)
    /// - `KESTREL_TIMER_SHARDS`: timer shards (default: 16)
    /// - `KESTREL_TIMER_SCAN_INTERVAL_MS`: scan interval (default: 1000)
    /// - `KESTREL_TIMER_BATCH_SIZE`: due timers per shard and scan (default: 100)
    /// - `KESTREL_TIMER_CONCURRENCY`: timer processors (default: 4)
    /// - `KESTREL_TIMER_MAX_FIRE_DELAY_MS`: lateness warning threshold (default: 5000)
    /// - `KESTREL_TASK_DEFAULT_TIMEOUT_SECS`: in-flight task deadline (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KESTREL_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let event_encoding: EventEncoding = std::env::var("KESTREL_EVENT_ENCODING")
            .unwrap_or_else(|_| "json".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("KESTREL_EVENT_ENCODING", "must be 'json' or 'proto'")
            })?;

        let num_partitions: u32 = positive("KESTREL_NUM_PARTITIONS", 8)?;
        let ring_replicas: u32 = positive("KESTREL_RING_REPLICAS", 64)?;
        let priority_levels: u32 = positive("KESTREL_PRIORITY_LEVELS", 10)?;
        let timer_shards: u32 = positive("KESTREL_TIMER_SHARDS", 16)?;
        let scan_interval_ms: u64 = positive("KESTREL_TIMER_SCAN_INTERVAL_MS", 1000)?;
        let batch_size: usize = positive("KESTREL_TIMER_BATCH_SIZE", 100)?;
        let concurrency: usize = positive("KESTREL_TIMER_CONCURRENCY", 4)?;
        let max_fire_delay_ms: u64 = parse_var("KESTREL_TIMER_MAX_FIRE_DELAY_MS", 5000)?;
        let task_timeout_secs: u64 = positive("KESTREL_TASK_DEFAULT_TIMEOUT_SECS", 300)?;

        let matching = MatchingConfig {
            num_partitions,
            ring_replicas,
            priority_levels,
            default_priority: priority_levels / 2,
            default_task_timeout: Duration::from_secs(task_timeout_secs),
        };
        let timer = TimerServiceConfig {
            num_shards: timer_shards,
            scan_interval: Duration::from_millis(scan_interval_ms),
            batch_size,
            processor_concurrency: concurrency,
            max_fire_delay: Duration::from_millis(max_fire_delay_ms),
            ..Default::default()
        };

        Ok(Self {
            database_url,
            event_encoding,
            matching,
            timer,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let value = parse_var(name, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid(name, "must be a positive integer"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
