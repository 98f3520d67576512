use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

const BIND_ENV: &str = "RELAY_BIND";
const DB_PATH_ENV: &str = "RELAY_DB_PATH";
const NATS_URL_ENV: &str = "NATS_URL";
const STREAM_ENV: &str = "RELAY_STREAM";

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_DB_PATH: &str = "relay.db";
const DEFAULT_STREAM: &str = "RELAY";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    /// Queued dispatch over JetStream when set, direct sends otherwise.
    pub nats_url: Option<String>,
    pub stream: String,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let bind = non_empty(BIND_ENV).unwrap_or_else(|| DEFAULT_BIND.into());
        let addr = bind
            .trim()
            .parse()
            .with_context(|| format!("{BIND_ENV} must be host:port, got `{bind}`"))?;
        Ok(Self {
            addr,
            db_path: non_empty(DB_PATH_ENV)
                .unwrap_or_else(|| DEFAULT_DB_PATH.into())
                .into(),
            nats_url: non_empty(NATS_URL_ENV),
            stream: non_empty(STREAM_ENV).unwrap_or_else(|| DEFAULT_STREAM.into()),
        })
    }

    pub fn is_queued(&self) -> bool {
        self.nats_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_select_direct_mode() {
        let cfg = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.addr.port(), 8080);
        assert_eq!(cfg.db_path, PathBuf::from("relay.db"));
        assert_eq!(cfg.stream, "RELAY");
        assert!(!cfg.is_queued());
    }

    #[test]
    fn nats_url_switches_to_queued_mode() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("NATS_URL", "nats://127.0.0.1:4222"),
            ("RELAY_BIND", "127.0.0.1:9000"),
            ("RELAY_STREAM", "RELAY_TEST"),
        ]))
        .unwrap();
        assert!(cfg.is_queued());
        assert_eq!(cfg.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.stream, "RELAY_TEST");
    }

    #[test]
    fn blank_nats_url_stays_direct() {
        let cfg = NodeConfig::from_lookup(lookup(&[("NATS_URL", "  ")])).unwrap();
        assert!(!cfg.is_queued());
    }

    #[test]
    fn malformed_bind_is_rejected() {
        assert!(NodeConfig::from_lookup(lookup(&[("RELAY_BIND", "nowhere")])).is_err());
    }
}
