//! Server Configuration
//!
//! Loads configuration from a YAML file (`config.yaml`, `config.yml`, or the
//! path in `SFU_CONFIG_PATH`), then applies environment variable overrides.
//! Invalid values are logged and replaced with defaults.

use std::env;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default lower bound of the ICE UDP ephemeral port range.
pub const DEFAULT_UDP_PORT_MIN: u16 = 50_000;

/// Default upper bound of the ICE UDP ephemeral port range.
pub const DEFAULT_UDP_PORT_MAX: u16 = 60_000;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to (env: `BIND_ADDRESS`).
    pub bind_address: String,

    /// Lower bound of the UDP port range used for ICE (env: `UDP_PORT_MIN`).
    pub udp_port_min: u16,

    /// Upper bound of the UDP port range used for ICE (env: `UDP_PORT_MAX`).
    pub udp_port_max: u16,

    /// Public IP installed as a NAT 1:1 host candidate when non-empty
    /// (env: `PUBLIC_IP`).
    pub public_ip: String,

    /// STUN server advertised to clients via `/api/config`
    /// (env: `STUN_SERVER`).
    pub stun_server: String,

    /// TURN server advertised to clients (optional, env: `TURN_SERVER`).
    pub turn_server: Option<String>,

    /// TURN username (env: `TURN_USERNAME`).
    pub turn_username: Option<String>,

    /// TURN credential (env: `TURN_CREDENTIAL`).
    pub turn_credential: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".into(),
            udp_port_min: DEFAULT_UDP_PORT_MIN,
            udp_port_max: DEFAULT_UDP_PORT_MAX,
            public_ip: String::new(),
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the first readable config file,
    /// then environment overrides. Validation failures fall back to default
    /// ports rather than aborting startup.
    pub fn load() -> Self {
        let mut config = Self::default();

        let candidates = ["config.yaml".to_string(), "config.yml".to_string()]
            .into_iter()
            .chain(env::var("SFU_CONFIG_PATH").ok());

        for path in candidates {
            if path.is_empty() {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_yaml::from_str::<Self>(&contents) {
                Ok(loaded) => {
                    debug!(path = %path, "Configuration file loaded");
                    config = loaded;
                    break;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to parse configuration file");
                }
            }
        }

        config.apply_env_overrides();

        if let Err(e) = config.validate() {
            warn!(error = %e, "Invalid UDP port range, using defaults");
            config.udp_port_min = DEFAULT_UDP_PORT_MIN;
            config.udp_port_max = DEFAULT_UDP_PORT_MAX;
        }

        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = parse_env("UDP_PORT_MIN") {
            self.udp_port_min = v;
        }
        if let Some(v) = parse_env("UDP_PORT_MAX") {
            self.udp_port_max = v;
        }
        if let Some(v) = non_empty_env("PUBLIC_IP") {
            self.public_ip = v;
        }
        if let Some(v) = non_empty_env("STUN_SERVER") {
            self.stun_server = v;
        }
        if let Some(v) = non_empty_env("TURN_SERVER") {
            self.turn_server = Some(v);
        }
        if let Some(v) = non_empty_env("TURN_USERNAME") {
            self.turn_username = Some(v);
        }
        if let Some(v) = non_empty_env("TURN_CREDENTIAL") {
            self.turn_credential = Some(v);
        }
    }

    /// Check the UDP port range.
    pub fn validate(&self) -> Result<()> {
        if self.udp_port_min == 0 || self.udp_port_max == 0 {
            bail!("UDP ports must be greater than zero");
        }
        if self.udp_port_min > self.udp_port_max {
            bail!("UDP port range minimum exceeds maximum");
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.udp_port_min, 50_000);
        assert_eq!(config.udp_port_max, 60_000);
        assert!(config.public_ip.is_empty());
        assert_eq!(config.bind_address, "0.0.0.0:9090");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_ports() {
        let config = Config {
            udp_port_min: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            udp_port_max: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let config = Config {
            udp_port_min: 60_000,
            udp_port_max: 50_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_overrides_named_fields_only() {
        let config: Config =
            serde_yaml::from_str("udp_port_min: 40000\npublic_ip: 203.0.113.7\n").unwrap();
        assert_eq!(config.udp_port_min, 40_000);
        assert_eq!(config.udp_port_max, DEFAULT_UDP_PORT_MAX);
        assert_eq!(config.public_ip, "203.0.113.7");
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence() {
        env::set_var("UDP_PORT_MIN", "41000");
        env::set_var("UDP_PORT_MAX", "42000");
        env::set_var("PUBLIC_IP", "198.51.100.2");

        let config = Config::load();
        assert_eq!(config.udp_port_min, 41_000);
        assert_eq!(config.udp_port_max, 42_000);
        assert_eq!(config.public_ip, "198.51.100.2");

        env::remove_var("UDP_PORT_MIN");
        env::remove_var("UDP_PORT_MAX");
        env::remove_var("PUBLIC_IP");
    }

    #[test]
    #[serial]
    fn invalid_env_range_falls_back_to_defaults() {
        env::set_var("UDP_PORT_MIN", "55000");
        env::set_var("UDP_PORT_MAX", "51000");

        let config = Config::load();
        assert_eq!(config.udp_port_min, DEFAULT_UDP_PORT_MIN);
        assert_eq!(config.udp_port_max, DEFAULT_UDP_PORT_MAX);

        env::remove_var("UDP_PORT_MIN");
        env::remove_var("UDP_PORT_MAX");
    }
}
