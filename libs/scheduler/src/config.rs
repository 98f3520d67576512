use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const INTERVAL_ENV: &str = "SCHEDULER_INTERVAL_SECS";
const BATCH_SIZE_ENV: &str = "SCHEDULER_BATCH_SIZE";
const RETRY_DELAY_ENV: &str = "SCHEDULER_RETRY_DELAY_SECS";
const MAX_ATTEMPTS_ENV: &str = "SCHEDULER_MAX_ATTEMPTS";
const HORIZON_DAYS_ENV: &str = "SCHEDULER_HORIZON_DAYS";
const ACTION_TIMEOUT_ENV: &str = "SCHEDULER_ACTION_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between two polls.
    pub interval: Duration,
    /// Due actions fetched per poll.
    pub batch_size: usize,
    /// Linear delay added to `scheduled_for` after a failed attempt.
    pub retry_delay: Duration,
    pub max_attempts: u32,
    /// Furthest point in the future an action may be scheduled for.
    pub horizon: Duration,
    pub action_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 10,
            retry_delay: Duration::from_secs(5 * 60),
            max_attempts: 3,
            horizon: Duration::from_secs(90 * 24 * 60 * 60),
            action_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// How long a claim may stay PROCESSING before the scheduler assumes its
    /// worker died and settles it.
    pub fn processing_lease(&self) -> Duration {
        self.action_timeout + self.interval.max(Duration::from_secs(60))
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<u64>().with_context(|| {
                        format!("{key} must be a non-negative integer, got `{raw}`")
                    })
                })
                .transpose()
        };

        let interval = number(INTERVAL_ENV)?.map_or(defaults.interval, Duration::from_secs);
        if interval.is_zero() {
            bail!("{INTERVAL_ENV} must be greater than zero");
        }
        Ok(Self {
            interval,
            batch_size: number(BATCH_SIZE_ENV)?
                .map_or(defaults.batch_size, |n| n.max(1) as usize),
            retry_delay: number(RETRY_DELAY_ENV)?.map_or(defaults.retry_delay, Duration::from_secs),
            max_attempts: number(MAX_ATTEMPTS_ENV)?
                .map_or(defaults.max_attempts, |n| n.clamp(1, u32::MAX as u64) as u32),
            horizon: number(HORIZON_DAYS_ENV)?
                .map_or(defaults.horizon, |days| Duration::from_secs(days * 24 * 60 * 60)),
            action_timeout: number(ACTION_TIMEOUT_ENV)?
                .map_or(defaults.action_timeout, Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SchedulerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.retry_delay, Duration::from_secs(300));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.horizon, Duration::from_secs(90 * 86_400));
        assert_eq!(cfg.processing_lease(), Duration::from_secs(90));
    }

    #[test]
    fn overrides_and_errors() {
        let cfg = SchedulerConfig::from_lookup(|key| match key {
            "SCHEDULER_BATCH_SIZE" => Some("0".into()),
            "SCHEDULER_HORIZON_DAYS" => Some("7".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.horizon, Duration::from_secs(7 * 86_400));

        let err = SchedulerConfig::from_lookup(|key| {
            (key == "SCHEDULER_INTERVAL_SECS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("SCHEDULER_INTERVAL_SECS"));
    }
}
