#![forbid(unsafe_code)]

// Server configuration read from the environment

use anyhow::{anyhow, Result};
use std::net::IpAddr;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// When set, `/metrics` requires `Authorization: Bearer <token>`
    pub metrics_token: Option<String>,
    /// Address advertised in ICE candidates
    pub announce_ip: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            metrics_token: None,
            announce_ip: None,
        }
    }
}

impl ServerConfig {
    /// Reads `PORT`, `MAX_CONNECTIONS`, `METRICS_TOKEN` and `ANNOUNCE_IP`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            config.port = port.parse().map_err(|_| anyhow!("Invalid PORT: {port}"))?;
        }

        if let Some(max) = lookup("MAX_CONNECTIONS") {
            match max.parse::<usize>() {
                Ok(0) => warn!(
                    "MAX_CONNECTIONS=0 would reject all connections, using default {}",
                    DEFAULT_MAX_CONNECTIONS
                ),
                Ok(n) => config.max_connections = n,
                Err(_) => warn!("Ignoring unparseable MAX_CONNECTIONS={}", max),
            }
        }

        config.metrics_token = lookup("METRICS_TOKEN").filter(|t| !t.is_empty());

        if let Some(ip) = lookup("ANNOUNCE_IP") {
            let addr = ip.parse().map_err(|_| anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
            config.announce_ip = Some(addr);
        }

        info!(
            "Config: port={} max_connections={} metrics_auth={}",
            config.port,
            config.max_connections,
            config.metrics_token.is_some()
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(config(&[]).unwrap(), ServerConfig::default());
    }

    #[test]
    fn zero_max_connections_falls_back_to_default() {
        let config = config(&[("MAX_CONNECTIONS", "0"), ("PORT", "8080")]).unwrap();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn bad_announce_ip_is_an_error() {
        assert!(config(&[("ANNOUNCE_IP", "not-an-ip")]).is_err());
        let config = config(&[("ANNOUNCE_IP", "10.0.0.5"), ("METRICS_TOKEN", "s3cret")]).unwrap();
        assert_eq!(config.announce_ip, Some("10.0.0.5".parse().unwrap()));
        assert_eq!(config.metrics_token.as_deref(), Some("s3cret"));
    }
}
