//! Node configuration file
//!
//! YAML configuration loaded at startup. Only `identity-location` is
//! strictly required; everything else has a sensible default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use libp2p::Multiaddr;
use serde::Deserialize;

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_listen_addresses() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/0".to_string()]
}

fn default_circuit_length() -> usize {
    3
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Location of the node identity keyfile.
    pub identity_location: PathBuf,

    /// Do not listen on any port and do not promote this node.
    #[serde(default)]
    pub hidden_mode: bool,

    /// Allow circuits to exit to the clearnet through this node.
    #[serde(default)]
    pub exit_node: bool,

    /// Multiaddresses to listen on.
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: Vec<String>,

    /// Multiaddresses advertised instead of the observed ones.
    #[serde(default)]
    pub advertise_addresses: Vec<String>,

    /// Re-advertisement interval.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Also use the well-known default bootstrap hosts.
    #[serde(default)]
    pub defaults: bool,

    /// Custom bootstrap hosts, `/ip4/../tcp/../p2p/..` form.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Block startup until the routing table is populated.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProxyConfig {
    /// Local address for the HTTP CONNECT proxy.
    pub proxy_address: SocketAddr,

    /// Number of relays per circuit.
    #[serde(default = "default_circuit_length")]
    pub circuit_length: usize,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&contents).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.identity_location.as_os_str().is_empty() {
            bail!("no identity-location provided in the configuration");
        }
        if !self.hidden_mode && self.listen_addresses.is_empty() {
            bail!("listen-addresses must not be empty outside hidden mode");
        }
        Ok(())
    }

    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        parse_multiaddrs(&self.listen_addresses)
    }

    pub fn advertise_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        parse_multiaddrs(&self.advertise_addresses)
    }
}

fn parse_multiaddrs(addrs: &[String]) -> Result<Vec<Multiaddr>> {
    addrs
        .iter()
        .map(|a| {
            a.parse::<Multiaddr>()
                .with_context(|| format!("bad multiaddr: {a}"))
        })
        .collect()
}

/// Duration (de)serialization for values like `1m`, `90s`.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad duration: {raw}")))
    }

    fn parse(raw: &str) -> Option<Duration> {
        let raw = raw.trim();
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        let (value, unit) = raw.split_at(raw.find(|c: char| c.is_alphabetic())?);
        let value: u64 = value.parse().ok()?;
        match unit {
            "s" => Some(Duration::from_secs(value)),
            "m" => Some(Duration::from_secs(value * 60)),
            "h" => Some(Duration::from_secs(value * 3600)),
            "ms" => Some(Duration::from_millis(value)),
            _ => None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_yaml::from_str("identity-location: /tmp/node.key\n").unwrap();
        assert!(!config.hidden_mode);
        assert!(!config.exit_node);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert!(config.proxy.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
identity-location: ~/.onionp2p/node.key
hidden-mode: false
exit-node: true
listen-addresses:
  - /ip4/0.0.0.0/tcp/4001
advertise-addresses:
  - /ip4/203.0.113.7/tcp/4001
ttl: 2m
bootstrap:
  defaults: true
  hosts:
    - /ip4/127.0.0.1/tcp/9000/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN
  wait: true
proxy:
  proxy-address: 127.0.0.1:8118
  circuit-length: 3
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert!(config.exit_node);
        assert_eq!(config.ttl, Duration::from_secs(120));
        let bootstrap = config.bootstrap.as_ref().unwrap();
        assert!(bootstrap.defaults && bootstrap.wait);
        assert_eq!(bootstrap.hosts.len(), 1);
        assert_eq!(config.proxy.as_ref().unwrap().circuit_length, 3);
        config.listen_multiaddrs().unwrap();
        config.advertise_multiaddrs().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = "identity-location: /tmp/k\ntypo-field: true\n";
        assert!(serde_yaml::from_str::<Config>(raw).is_err());
    }
}
