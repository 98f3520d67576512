use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryProtocol {
    Grpc,
    HttpProtobuf,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub protocol: TelemetryProtocol,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub json_logs: bool,
    pub enabled: bool,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        Self::from_lookup(default_service_name, default_service_version, |key| {
            env::var(key).ok()
        })
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(
        default_service_name: &str,
        default_service_version: &str,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_default();
        let protocol = match lookup("OTEL_EXPORTER_OTLP_PROTOCOL")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            Some("http" | "http/protobuf") => TelemetryProtocol::HttpProtobuf,
            _ => TelemetryProtocol::Grpc,
        };
        let service_name =
            lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let service_version = lookup("OTEL_SERVICE_VERSION")
            .unwrap_or_else(|| default_service_version.to_string());
        let environment = lookup("OTEL_RESOURCE_ATTRIBUTES")
            .and_then(|attrs| parse_environment_from_resource(&attrs))
            .or_else(|| lookup("RELAY_ENV"))
            .unwrap_or_else(|| "dev".into());
        let json_logs = lookup("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        let enabled = lookup("ENABLE_OTEL")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            endpoint,
            protocol,
            service_name,
            service_version,
            environment,
            json_logs,
            enabled,
        }
    }

    pub fn exporter_enabled(&self) -> bool {
        self.enabled && !self.endpoint.trim().is_empty()
    }
}

fn parse_environment_from_resource(value: &str) -> Option<String> {
    value.split(',').find_map(|kv| {
        let (key, val) = kv.split_once('=')?;
        (key.trim() == "deployment.environment").then(|| val.trim().to_string())
    })
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
    fn defaults_to_json_logs_without_exporter() {
        let cfg = TelemetryConfig::from_lookup("relay-node", "0.4.18", lookup(&[]));
        assert!(cfg.json_logs);
        assert!(!cfg.exporter_enabled());
        assert_eq!(cfg.service_name, "relay-node");
        assert_eq!(cfg.environment, "dev");
    }

    #[test]
    fn exporter_needs_flag_and_endpoint() {
        let cfg = TelemetryConfig::from_lookup(
            "relay-node",
            "0.4.18",
            lookup(&[("ENABLE_OTEL", "true")]),
        );
        assert!(!cfg.exporter_enabled());

        let cfg = TelemetryConfig::from_lookup(
            "relay-node",
            "0.4.18",
            lookup(&[
                ("ENABLE_OTEL", "on"),
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4318"),
                ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/protobuf"),
                ("LOG_FORMAT", "plain"),
                (
                    "OTEL_RESOURCE_ATTRIBUTES",
                    "team=relay, deployment.environment=staging",
                ),
            ]),
        );
        assert!(cfg.exporter_enabled());
        assert_eq!(cfg.protocol, TelemetryProtocol::HttpProtobuf);
        assert!(!cfg.json_logs);
        assert_eq!(cfg.environment, "staging");
    }
}
