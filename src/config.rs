//! Bridge configuration file
//!
//! The binary reads a TOML file with four sections: `[device]`,
//! `[credentials]`, `[mqtt]` and `[publish]`. Library callers that do not
//! want a file build [`crate::manager::ManagerSettings`] directly.

use crate::identity::DeviceIdentity;
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Smallest keep-alive the transport accepts
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub publish: PublishSection,
}

/// Device identity as registered with the cloud broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
    pub device_id: String,
}

/// Paths to the device key and the broker trust bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    /// RSA private key (PEM) used to sign connection tokens
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    /// CA bundle (PEM) used to verify the broker
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            ca_cert_path: default_ca_cert_path(),
        }
    }
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("etc/google_iot_rsa_private.pem")
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("etc/google_iot_cert.pem")
}

/// Transport tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Keep-alive in seconds. Lower values detect a dead link sooner.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Device-relative topics subscribed on every connect
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<String>,
    /// Delays between transport reconnect attempts, in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: Vec<u64>,
    /// Delay once the backoff pattern is exhausted, in milliseconds
    #[serde(default = "default_reconnect_sustained_ms")]
    pub reconnect_sustained_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            subscriptions: default_subscriptions(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_sustained_ms: default_reconnect_sustained_ms(),
        }
    }
}

fn default_keep_alive_secs() -> u64 {
    10
}

fn default_subscriptions() -> Vec<String> {
    vec!["config".to_string()]
}

fn default_reconnect_backoff_ms() -> Vec<u64> {
    vec![500, 1000, 2000, 5000]
}

fn default_reconnect_sustained_ms() -> u64 {
    10_000
}

/// Where the `run` command publishes stdin lines
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    #[serde(default = "default_publish_topic")]
    pub topic: String,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            topic: default_publish_topic(),
        }
    }
}

fn default_publish_topic() -> String {
    "state".to_string()
}

/// Configuration and key material errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unusable key material: {0}")]
    KeyMaterial(String),
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity().validate()?;

        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                self.mqtt.keep_alive_secs
            )));
        }

        if let Some(topic) = self
            .mqtt
            .subscriptions
            .iter()
            .find(|t| t.is_empty())
        {
            return Err(ConfigError::InvalidConfig(format!(
                "subscription topic '{topic}' is empty"
            )));
        }

        if self.publish.topic.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "publish topic must not be empty".to_string(),
            ));
        }

        self.reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        Ok(())
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            &self.device.project_id,
            &self.device.region,
            &self.device.registry_id,
            &self.device.device_id,
        )
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            backoff_pattern: self.mqtt.reconnect_backoff_ms.clone(),
            sustained_delay: self.mqtt.reconnect_sustained_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
project_id = "my-project"
region = "us-central1"
registry_id = "my-registry"
device_id = "dev-42"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: BridgeConfig = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.device.device_id, "dev-42");
        assert_eq!(config.mqtt.keep_alive_secs, 10);
        assert_eq!(config.mqtt.subscriptions, vec!["config"]);
        assert_eq!(config.publish.topic, "state");
        assert_eq!(
            config.credentials.private_key_path,
            PathBuf::from("etc/google_iot_rsa_private.pem")
        );
        assert_eq!(
            config.credentials.ca_cert_path,
            PathBuf::from("etc/google_iot_cert.pem")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
project_id = "p"
region = "europe-west1"
registry_id = "r"
device_id = "d"

[credentials]
private_key_path = "/keys/device.pem"
ca_cert_path = "/keys/roots.pem"

[mqtt]
keep_alive_secs = 30
subscriptions = ["config", "commands/#"]
reconnect_backoff_ms = [100, 200]
reconnect_sustained_ms = 400

[publish]
topic = "events"
"#;
        let config: BridgeConfig = toml::from_str(toml_content).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.mqtt.subscriptions.len(), 2);
        assert_eq!(config.publish.topic, "events");

        let reconnect = config.reconnect_config();
        assert_eq!(reconnect.backoff_pattern, vec![100, 200]);
        assert_eq!(reconnect.sustained_delay, 400);
    }

    #[test]
    fn test_identity_from_config() {
        let config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(
            config.identity().client_id(),
            "projects/my-project/locations/us-central1/registries/my-registry/devices/dev-42"
        );
    }

    #[test]
    fn test_keep_alive_below_minimum_rejected() {
        let mut config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.mqtt.keep_alive_secs = 2;

        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_subscription_rejected() {
        let mut config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.mqtt.subscriptions.push(String::new());

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_leading_slash_topic_accepted_verbatim() {
        let mut config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.publish.topic = "/state".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sustained_delay_rejected() {
        let mut config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.mqtt.reconnect_sustained_ms = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_device_id_rejected() {
        let mut config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        config.device.device_id = "dev/42".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let config: BridgeConfig = toml::from_str(MINIMAL).unwrap();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: BridgeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }
}
