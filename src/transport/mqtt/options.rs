//! Pure MQTT option construction and transport reconnect policy
//!
//! Nothing here touches the network; the session module turns these options
//! into a rumqttc client and event loop.

use crate::auth::ExposeSecret;
use crate::config::{ConfigError, MIN_KEEP_ALIVE_SECS};
use crate::error::{BridgeError, BridgeResult};
use crate::transport::SessionParams;
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::time::Duration;

/// Largest packet accepted or sent (device configs can be large)
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Delays between transport reconnect attempts
///
/// Applies inside one session only. The rebuild protocol in the manager is a
/// separate mechanism layered on top.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay per attempt in milliseconds, in order
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![500, 1000, 2000, 5000],
            sustained_delay: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sustained_delay == 0 {
            return Err("reconnect sustained delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Build rumqttc options for one session
pub fn configure_mqtt_options(
    params: &SessionParams,
    host: &str,
    port: u16,
    keep_alive: Duration,
) -> BridgeResult<MqttOptions> {
    if keep_alive < Duration::from_secs(MIN_KEEP_ALIVE_SECS) {
        return Err(BridgeError::Configuration(ConfigError::InvalidConfig(format!(
            "keep-alive must be at least {MIN_KEEP_ALIVE_SECS}s, got {}s",
            keep_alive.as_secs()
        ))));
    }

    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), host, port);
    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    mqtt_options.set_credentials(
        params.username.clone(),
        params.token.jwt().expose_secret().to_string(),
    );

    // Server authentication only; the device proves itself with the token
    mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: params.ca_bundle.clone(),
        alpn: None,
        client_auth: None,
    }));

    Ok(mqtt_options)
}
