//! Broker connection configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Result, V2vError};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC: &str = "etsi-its-cam-unsecured";

const ENV_ADDRESS: &str = "V2V_BROKER";
const ENV_PORT: &str = "V2V_PORT";
const ENV_TOPIC: &str = "V2V_TOPIC";

/// Broker address, port and topic.
///
/// Swapped as a whole by the connection manager; nothing ever observes a
/// mix of an old and a new configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub address: String,
    pub port: u16,
    pub topic: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Build and validate a configuration.
    pub fn new(address: impl Into<String>, port: u16, topic: impl Into<String>) -> Result<Self> {
        let config = Self { address: address.into(), port, topic: topic.into() };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable for connect, subscribe and publish.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(V2vError::config("broker address is empty"));
        }
        if self.port == 0 {
            return Err(V2vError::config("port must be between 1 and 65535"));
        }
        if self.topic.trim().is_empty() {
            return Err(V2vError::config("topic is empty"));
        }
        if self.topic.contains(['+', '#']) {
            return Err(V2vError::config(format!(
                "topic '{}' contains wildcards and cannot be published to",
                self.topic
            )));
        }
        Ok(())
    }

    /// Parse a port typed by a user, rejecting anything non-numeric.
    pub fn parse_port(raw: &str) -> Result<u16> {
        let port: u16 = raw
            .trim()
            .parse()
            .map_err(|_| V2vError::config(format!("port must be a number, got '{raw}'")))?;
        if port == 0 {
            return Err(V2vError::config("port must be between 1 and 65535"));
        }
        Ok(port)
    }

    /// Parse a YAML document; missing keys fall back to the defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| V2vError::config(format!("invalid YAML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| V2vError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    /// Apply `V2V_BROKER`, `V2V_PORT` and `V2V_TOPIC` from the environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(address) = lookup(ENV_ADDRESS) {
            self.address = address;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = Self::parse_port(&port)?;
        }
        if let Some(topic) = lookup(ENV_TOPIC) {
            self.topic = topic;
        }
        self.validate()?;
        Ok(self)
    }
}
