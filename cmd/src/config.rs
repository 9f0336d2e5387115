//! Configuration handling for the tether node.
//!
//! Reads the YAML config file when present, then applies `TETHER_*`
//! environment overrides.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Whether STUN resolution is enabled
    pub stun_enabled: bool,
    /// STUN server hostnames
    pub stun_servers: Vec<String>,
    /// Whether TURN relaying is enabled
    pub turn_enabled: bool,
    /// TURN server hostname
    pub turn_server: String,
    /// TURN username
    pub turn_username: String,
    /// TURN password
    pub turn_password: String,
    /// TURN realm
    pub turn_realm: String,
    /// Seconds between liveness beacons
    pub beacon_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stun_enabled: false,
            stun_servers: Vec::new(),
            turn_enabled: false,
            turn_server: String::new(),
            turn_username: String::new(),
            turn_password: String::new(),
            turn_realm: String::new(),
            beacon_interval_secs: 25,
        }
    }
}

/// Root structure of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    node: Option<NodeSection>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    log_level: Option<String>,
    beacon_interval_secs: Option<u64>,
    stun: Option<StunSection>,
    turn: Option<TurnSection>,
}

#[derive(Debug, Deserialize)]
struct StunSection {
    enabled: Option<bool>,
    servers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TurnSection {
    enabled: Option<bool>,
    server: Option<String>,
    username: Option<String>,
    password: Option<String>,
    realm: Option<String>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            if let Ok(root) = serde_yaml::from_str::<RootConfig>(&content) {
                config.apply_root_config(root);
                info!("loaded configuration from {:?}", config_path.as_ref());
            } else {
                warn!(
                    "failed to parse config file {:?}, using defaults",
                    config_path.as_ref()
                );
            }
        } else {
            warn!("config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let Some(node) = root.node else {
            return;
        };
        if let Some(level) = node.log_level {
            self.log_level = level;
        }
        if let Some(secs) = node.beacon_interval_secs {
            self.beacon_interval_secs = secs;
        }
        if let Some(stun) = node.stun {
            if let Some(enabled) = stun.enabled {
                self.stun_enabled = enabled;
            }
            if let Some(servers) = stun.servers {
                self.stun_servers = servers;
            }
        }
        if let Some(turn) = node.turn {
            if let Some(enabled) = turn.enabled {
                self.turn_enabled = enabled;
            }
            if let Some(server) = turn.server {
                self.turn_server = server;
            }
            if let Some(username) = turn.username {
                self.turn_username = username;
            }
            if let Some(password) = turn.password {
                self.turn_password = password;
            }
            if let Some(realm) = turn.realm {
                self.turn_realm = realm;
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            info!("log level overridden by environment: {}", level);
            self.log_level = level;
        }
        if let Ok(server) = std::env::var("TETHER_STUN_SERVER") {
            self.stun_enabled = true;
            self.stun_servers = vec![server];
        }
        if let Ok(server) = std::env::var("TETHER_TURN_SERVER") {
            self.turn_enabled = true;
            self.turn_server = server;
            self.turn_username = std::env::var("TETHER_TURN_USERNAME").unwrap_or_default();
            self.turn_password = std::env::var("TETHER_TURN_PASSWORD").unwrap_or_default();
            self.turn_realm = std::env::var("TETHER_TURN_REALM").unwrap_or_default();
        }
        if let Ok(secs) = std::env::var("TETHER_BEACON_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                self.beacon_interval_secs = secs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.stun_enabled);
        assert_eq!(config.beacon_interval_secs, 25);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node:
  log_level: debug
  beacon_interval_secs: 10
  stun:
    enabled: true
    servers:
      - stun.example.org:3478
  turn:
    enabled: true
    server: turn.example.org:3478
    username: user
    password: secret
    realm: example.org
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.beacon_interval_secs, 10);
        assert!(config.stun_enabled);
        assert_eq!(config.stun_servers, vec!["stun.example.org:3478"]);
        assert!(config.turn_enabled);
        assert_eq!(config.turn_server, "turn.example.org:3478");
        assert_eq!(config.turn_realm, "example.org");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = NodeConfig::load_from_file("/nonexistent/tether.yaml").unwrap();
        assert_eq!(config.log_level, NodeConfig::default().log_level);
    }
}
