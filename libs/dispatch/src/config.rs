use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::DEFAULT_SEND_TOPIC;

const MAX_RETRIES_ENV: &str = "RELAY_MAX_RETRIES";
const SEND_TOPIC_ENV: &str = "RELAY_SEND_TOPIC";
const ADAPTER_TIMEOUT_ENV: &str = "RELAY_ADAPTER_TIMEOUT_SECS";
const REDELIVERY_DELAY_ENV: &str = "RELAY_REDELIVERY_DELAY_SECS";
const DEAD_LETTERS_ENV: &str = "RELAY_DEAD_LETTERS";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget stamped on every new outbound message.
    pub max_retries: u32,
    pub send_topic: String,
    pub adapter_timeout: Duration,
    pub redelivery_delay: Duration,
    pub dead_letters: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            send_topic: DEFAULT_SEND_TOPIC.into(),
            adapter_timeout: Duration::from_secs(30),
            redelivery_delay: Duration::from_secs(5),
            dead_letters: true,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_retries = match lookup(MAX_RETRIES_ENV) {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("{MAX_RETRIES_ENV} must be an integer, got `{raw}`"))?
                .max(1),
            None => defaults.max_retries,
        };
        let adapter_timeout = match lookup(ADAPTER_TIMEOUT_ENV) {
            Some(raw) => Duration::from_secs(parse_secs(ADAPTER_TIMEOUT_ENV, &raw)?),
            None => defaults.adapter_timeout,
        };
        let redelivery_delay = match lookup(REDELIVERY_DELAY_ENV) {
            Some(raw) => Duration::from_secs(parse_secs(REDELIVERY_DELAY_ENV, &raw)?),
            None => defaults.redelivery_delay,
        };

        Ok(Self {
            max_retries,
            send_topic: lookup(SEND_TOPIC_ENV)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.send_topic),
            adapter_timeout,
            redelivery_delay,
            dead_letters: lookup(DEAD_LETTERS_ENV)
                .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(defaults.dead_letters),
        })
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{key} must be a number of seconds, got `{raw}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = DispatchConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.send_topic, "relay.msg.send");
        assert_eq!(cfg.adapter_timeout, Duration::from_secs(30));
        assert!(cfg.dead_letters);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = DispatchConfig::from_lookup(|key| match key {
            "RELAY_MAX_RETRIES" => Some("5".into()),
            "RELAY_DEAD_LETTERS" => Some("off".into()),
            "RELAY_REDELIVERY_DELAY_SECS" => Some("0".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert!(!cfg.dead_letters);
        assert_eq!(cfg.redelivery_delay, Duration::ZERO);
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let err = DispatchConfig::from_lookup(|key| {
            (key == "RELAY_ADAPTER_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("RELAY_ADAPTER_TIMEOUT_SECS"));
    }
}
