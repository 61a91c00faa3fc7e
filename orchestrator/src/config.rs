// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{EngineError, EngineResult};
use crate::event_pipeline::EventKind;
use ledger_orchestrator_config::Config;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// JSON-RPC endpoint of the remote ledger
    pub rpc_url: String,
    /// Append-only JSON-lines transaction history. In-memory when absent.
    #[serde(default)]
    pub history_path: Option<PathBuf>,
    /// Port for the prometheus `/metrics` endpoint. Disabled when absent.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub allowance: AllowanceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

impl Config for EngineConfig {}

impl EngineConfig {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            history_path: None,
            metrics_port: None,
            queue: QueueConfig::default(),
            events: EventsConfig::default(),
            allowance: AllowanceConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let check = |ok: bool, what: &str| {
            if ok {
                Ok(())
            } else {
                Err(EngineError::InvalidConfig(format!("{} must be non-zero", what)))
            }
        };
        check(self.queue.max_concurrent > 0, "queue.max-concurrent")?;
        check(self.queue.max_attempts > 0, "queue.max-attempts")?;
        check(!self.queue.tick_interval.is_zero(), "queue.tick-interval-ms")?;
        check(self.events.max_window > 0, "events.max-window")?;
        check(!self.events.poll_interval.is_zero(), "events.poll-interval-ms")?;
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueueConfig {
    /// Submissions allowed in flight at once, across all priorities
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry n waits `base_retry_delay * n`
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "base-retry-delay-ms", default = "default_base_retry_delay")]
    pub base_retry_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "tick-interval-ms", default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Cost used when estimation fails
    #[serde(default = "default_cost")]
    pub default_cost: u64,
    /// Terminal operations kept in the snapshot
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            base_retry_delay: default_base_retry_delay(),
            tick_interval: default_tick_interval(),
            default_cost: default_cost(),
            completed_retention: default_completed_retention(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_retry_delay() -> Duration {
    Duration::from_millis(2000)
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_cost() -> u64 {
    500_000
}

fn default_completed_retention() -> usize {
    100
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventsConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Maximum number of heights fetched per source per cycle
    #[serde(default = "default_max_window")]
    pub max_window: u64,
    /// Sources registered when the engine is built
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_window: default_max_window(),
            sources: vec![],
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_max_window() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    pub source_address: String,
    pub event_kind: EventKind,
    /// Last height considered processed. Polling resumes at the next one.
    #[serde(default)]
    pub start_height: Option<u64>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AllowanceConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "ttl-secs", default = "default_allowance_ttl")]
    pub ttl: Duration,
    /// Headroom added on top of the required amount when approving
    #[serde(default = "default_buffer_percent")]
    pub buffer_percent: u32,
    /// Approve the maximum amount instead of amount plus buffer
    #[serde(default)]
    pub unlimited: bool,
}

impl Default for AllowanceConfig {
    fn default() -> Self {
        Self {
            ttl: default_allowance_ttl(),
            buffer_percent: default_buffer_percent(),
            unlimited: false,
        }
    }
}

fn default_allowance_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_buffer_percent() -> u32 {
    10
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    /// How long confirmed speculative entries stay listed
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(
        rename = "confirmed-retention-secs",
        default = "default_confirmed_retention"
    )]
    pub confirmed_retention: Duration,
    /// How long failed entries stay listed so the UI can show the failure
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "failed-retention-secs", default = "default_failed_retention")]
    pub failed_retention: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            confirmed_retention: default_confirmed_retention(),
            failed_retention: default_failed_retention(),
        }
    }
}

fn default_confirmed_retention() -> Duration {
    Duration::from_secs(5)
}

fn default_failed_retention() -> Duration {
    Duration::from_secs(10)
}
