//! Tracker configuration and its environment-variable loader.

use std::env;

use thiserror::Error;

use crate::run::WorkflowPhase;

pub const ENV_WS_URL: &str = "RUN_TRACKER_WS_URL";
pub const ENV_RECONNECT_BASE_MS: &str = "RUN_TRACKER_RECONNECT_BASE_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "RUN_TRACKER_RECONNECT_MAX_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "RUN_TRACKER_MAX_RECONNECT_ATTEMPTS";
pub const ENV_TOKEN_FLUSH_MS: &str = "RUN_TRACKER_TOKEN_FLUSH_MS";
pub const ENV_TOKEN_MAX_WAIT_MS: &str = "RUN_TRACKER_TOKEN_MAX_WAIT_MS";
pub const ENV_WATCHDOG_TICK_MS: &str = "RUN_TRACKER_WATCHDOG_TICK_MS";
pub const ENV_TIMEOUT_DEFAULT_MS: &str = "RUN_TRACKER_TIMEOUT_DEFAULT_MS";
pub const ENV_MAX_RUNS: &str = "RUN_TRACKER_MAX_RUNS";
pub const ENV_ARCHIVE_LEN: &str = "RUN_TRACKER_ARCHIVE_LEN";
pub const ENV_TERMINAL_TTL_MS: &str = "RUN_TRACKER_TERMINAL_TTL_MS";
pub const ENV_GC_INTERVAL_MS: &str = "RUN_TRACKER_GC_INTERVAL_MS";
pub const ENV_ORPHAN_CAPACITY: &str = "RUN_TRACKER_ORPHAN_CAPACITY";
pub const ENV_SUBMISSION_TTL_MS: &str = "RUN_TRACKER_SUBMISSION_TTL_MS";
pub const ENV_STALE_AFTER_MS: &str = "RUN_TRACKER_STALE_AFTER_MS";
pub const ENV_DEFAULT_MODEL: &str = "RUN_TRACKER_DEFAULT_MODEL";

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/api/v1/chat/ws";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid {key}: value must be non-empty")]
    Empty { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Debounce settings for streamed token fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Quiet period after the latest fragment before a buffer is emitted.
    pub flush_delay_ms: u64,
    /// Upper bound on how long a continuously fed buffer may be held.
    pub max_wait_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: 50,
            max_wait_ms: 250,
        }
    }
}

/// Silence thresholds per workflow phase, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub starting: u64,
    pub spec: u64,
    pub plan: u64,
    pub execute: u64,
    pub verify: u64,
    pub repair: u64,
    pub default: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            starting: 30_000,
            spec: 60_000,
            plan: 60_000,
            execute: 120_000,
            verify: 120_000,
            repair: 120_000,
            default: 120_000,
        }
    }
}

impl PhaseTimeouts {
    #[must_use]
    pub fn for_phase(&self, phase: WorkflowPhase) -> u64 {
        match phase {
            WorkflowPhase::Starting => self.starting,
            WorkflowPhase::Spec => self.spec,
            WorkflowPhase::Plan => self.plan,
            WorkflowPhase::Execute => self.execute,
            WorkflowPhase::Verify => self.verify,
            WorkflowPhase::Repair => self.repair,
            WorkflowPhase::Complete => self.default,
        }
    }

    fn slot_mut(&mut self, phase: WorkflowPhase) -> &mut u64 {
        match phase {
            WorkflowPhase::Starting => &mut self.starting,
            WorkflowPhase::Spec => &mut self.spec,
            WorkflowPhase::Plan => &mut self.plan,
            WorkflowPhase::Execute => &mut self.execute,
            WorkflowPhase::Verify => &mut self.verify,
            WorkflowPhase::Repair => &mut self.repair,
            WorkflowPhase::Complete => &mut self.default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub tick_interval_ms: u64,
    pub timeouts: PhaseTimeouts,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15_000,
            timeouts: PhaseTimeouts::default(),
        }
    }
}

/// Memory bounds enforced by the garbage collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    pub max_runs: usize,
    pub archive_len: usize,
    pub terminal_ttl_ms: u64,
    pub gc_interval_ms: u64,
    pub orphan_capacity: usize,
    pub submission_ttl_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_runs: 100,
            archive_len: 50,
            terminal_ttl_ms: 300_000,
            gc_interval_ms: 60_000,
            orphan_capacity: 100,
            submission_ttl_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehydrateConfig {
    pub stale_after_ms: u64,
}

impl Default for RehydrateConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunTrackerConfig {
    pub transport: TransportConfig,
    pub aggregator: AggregatorConfig,
    pub watchdog: WatchdogConfig,
    pub retention: RetentionConfig,
    pub rehydrate: RehydrateConfig,
    pub default_model: Option<String>,
}

impl RunTrackerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unset keys keep their
    /// defaults; numeric values below one are clamped to one.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_WS_URL) {
            let url = url.trim().to_string();
            if url.is_empty() {
                return Err(ConfigError::Empty {
                    key: ENV_WS_URL.to_string(),
                });
            }
            config.transport.url = url;
        }
        set_u64(&lookup, ENV_RECONNECT_BASE_MS, &mut config.transport.reconnect_base_ms)?;
        set_u64(&lookup, ENV_RECONNECT_MAX_MS, &mut config.transport.reconnect_max_ms)?;
        config.transport.reconnect_max_ms = config
            .transport
            .reconnect_max_ms
            .max(config.transport.reconnect_base_ms);
        if let Some(attempts) = parse_number::<u32, _>(&lookup, ENV_MAX_RECONNECT_ATTEMPTS)? {
            config.transport.max_reconnect_attempts = attempts;
        }

        set_u64(&lookup, ENV_TOKEN_FLUSH_MS, &mut config.aggregator.flush_delay_ms)?;
        set_u64(&lookup, ENV_TOKEN_MAX_WAIT_MS, &mut config.aggregator.max_wait_ms)?;
        config.aggregator.max_wait_ms = config
            .aggregator
            .max_wait_ms
            .max(config.aggregator.flush_delay_ms);

        set_u64(&lookup, ENV_WATCHDOG_TICK_MS, &mut config.watchdog.tick_interval_ms)?;
        set_u64(&lookup, ENV_TIMEOUT_DEFAULT_MS, &mut config.watchdog.timeouts.default)?;
        for phase in WorkflowPhase::ALL {
            if phase == WorkflowPhase::Complete {
                continue;
            }
            let key = phase_timeout_key(phase);
            set_u64(&lookup, &key, config.watchdog.timeouts.slot_mut(phase))?;
        }

        set_usize(&lookup, ENV_MAX_RUNS, &mut config.retention.max_runs)?;
        set_usize(&lookup, ENV_ARCHIVE_LEN, &mut config.retention.archive_len)?;
        set_u64(&lookup, ENV_TERMINAL_TTL_MS, &mut config.retention.terminal_ttl_ms)?;
        set_u64(&lookup, ENV_GC_INTERVAL_MS, &mut config.retention.gc_interval_ms)?;
        set_usize(&lookup, ENV_ORPHAN_CAPACITY, &mut config.retention.orphan_capacity)?;
        set_u64(&lookup, ENV_SUBMISSION_TTL_MS, &mut config.retention.submission_ttl_ms)?;
        set_u64(&lookup, ENV_STALE_AFTER_MS, &mut config.rehydrate.stale_after_ms)?;

        config.default_model = lookup(ENV_DEFAULT_MODEL)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(config)
    }
}

/// `RUN_TRACKER_TIMEOUT_<PHASE>_MS`
#[must_use]
pub fn phase_timeout_key(phase: WorkflowPhase) -> String {
    format!(
        "RUN_TRACKER_TIMEOUT_{}_MS",
        phase.as_str().to_ascii_uppercase()
    )
}

fn parse_number<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|error| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: error.to_string(),
        })
}

fn set_u64<F>(lookup: &F, key: &str, slot: &mut u64) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_number::<u64, _>(lookup, key)? {
        *slot = value.max(1);
    }
    Ok(())
}

fn set_usize<F>(lookup: &F, key: &str, slot: &mut usize) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_number::<usize, _>(lookup, key)? {
        *slot = value.max(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        ConfigError, ENV_DEFAULT_MODEL, ENV_MAX_RUNS, ENV_RECONNECT_BASE_MS, ENV_RECONNECT_MAX_MS,
        ENV_STALE_AFTER_MS, ENV_WS_URL, RunTrackerConfig, phase_timeout_key,
    };
    use crate::run::WorkflowPhase;

    fn config_from(values: &[(&str, &str)]) -> Result<RunTrackerConfig, ConfigError> {
        let values: HashMap<String, String> = values
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        RunTrackerConfig::from_lookup(|key| values.get(key).map(ToString::to_string))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config_from(&[]).expect("default config");
        assert_eq!(config.transport.reconnect_base_ms, 1_000);
        assert_eq!(config.transport.reconnect_max_ms, 30_000);
        assert_eq!(config.transport.max_reconnect_attempts, 10);
        assert_eq!(config.aggregator.flush_delay_ms, 50);
        assert_eq!(config.watchdog.tick_interval_ms, 15_000);
        assert_eq!(config.watchdog.timeouts.starting, 30_000);
        assert_eq!(config.watchdog.timeouts.spec, 60_000);
        assert_eq!(config.watchdog.timeouts.verify, 120_000);
        assert_eq!(config.rehydrate.stale_after_ms, 120_000);
        assert_eq!(config.default_model, None);
    }

    #[test]
    fn overrides_are_applied_and_clamped() {
        let verify_key = phase_timeout_key(WorkflowPhase::Verify);
        let config = config_from(&[
            (ENV_WS_URL, " wss://example.test/ws "),
            (ENV_RECONNECT_BASE_MS, "500"),
            (ENV_RECONNECT_MAX_MS, "100"),
            (ENV_MAX_RUNS, "0"),
            (ENV_STALE_AFTER_MS, "60000"),
            (verify_key.as_str(), "90000"),
            (ENV_DEFAULT_MODEL, "  qwen  "),
        ])
        .expect("config");

        assert_eq!(config.transport.url, "wss://example.test/ws");
        assert_eq!(config.transport.reconnect_base_ms, 500);
        assert_eq!(config.transport.reconnect_max_ms, 500);
        assert_eq!(config.retention.max_runs, 1);
        assert_eq!(config.rehydrate.stale_after_ms, 60_000);
        assert_eq!(config.watchdog.timeouts.verify, 90_000);
        assert_eq!(config.default_model.as_deref(), Some("qwen"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        struct Case {
            name: &'static str,
            key: &'static str,
            value: &'static str,
        }

        let cases = [
            Case {
                name: "non numeric backoff",
                key: ENV_RECONNECT_BASE_MS,
                value: "fast",
            },
            Case {
                name: "negative cap",
                key: ENV_MAX_RUNS,
                value: "-4",
            },
        ];

        for case in cases {
            let error = config_from(&[(case.key, case.value)]).expect_err(case.name);
            assert!(
                error.to_string().contains(case.key),
                "{}: unexpected error {error}",
                case.name
            );
        }
    }

    #[test]
    fn empty_url_is_rejected() {
        let error = config_from(&[(ENV_WS_URL, "   ")]).expect_err("empty url");
        assert_eq!(
            error,
            ConfigError::Empty {
                key: ENV_WS_URL.to_string()
            }
        );
    }
}
