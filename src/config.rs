//! Deploy-time configuration for the telemetry session.
//!
//! Endpoints, credentials and the fixed topic sets are constants chosen at
//! build/deploy time. `Config::load()` starts from the built-in defaults,
//! merges an optional TOML file (path in `FEEDERLINK_CONFIG`) and finally
//! applies environment overrides, so a deployment never has to ship a
//! config file just to rotate a password.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

const CONFIG_PATH_VAR: &str = "FEEDERLINK_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host, without scheme. The session always speaks MQTT over
    /// secure WebSockets to `wss://{host}:{port}{path}`.
    pub host: String,
    pub port: u16,
    pub path: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Redial automatically after an unexpected transport closure.
    pub auto_reconnect: bool,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// Fixed inbound topic set, subscribed once the session is up.
    pub subscriptions: Vec<String>,
    /// Allow-list of outbound command topics.
    pub command_topics: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "mqttbroker.bc-pl.com".to_string(),
            port: 443,
            path: "/mqtt".to_string(),
            username: "mqttuser".to_string(),
            password: String::new(),
            client_id: "feederlink".to_string(),
            keep_alive_secs: 5,
            auto_reconnect: true,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 30_000,
            subscriptions: vec![
                topics::WEIGHT.to_string(),
                topics::MAINTENANCE_STATUS.to_string(),
            ],
            command_topics: topics::COMMANDS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl BrokerConfig {
    /// Full broker URL as rumqttc expects it for websocket transport.
    pub fn url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ImageStreamConfig {
    /// WebSocket endpoint emitting the image frames.
    pub url: String,
    pub ping_interval_secs: u64,
}

impl Default for ImageStreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://192.168.31.208:8001/ws/thermal-images/".to_string(),
            ping_interval_secs: 30,
        }
    }
}

impl ImageStreamConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// REST collaborator that persists cycle logs and calibration data.
/// The session only hands records off; it never calls these endpoints.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub image_stream: ImageStreamConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Defaults, then optional TOML file, then environment overrides.
    pub fn load() -> Self {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => match fs::read_to_string(&path) {
                Ok(raw) => match toml::from_str(&raw) {
                    Ok(parsed) => {
                        debug!("Loaded config from {}", path);
                        parsed
                    }
                    Err(e) => {
                        warn!("Config file {} is invalid, using defaults: {}", path, e);
                        Config::default()
                    }
                },
                Err(e) => {
                    warn!("Could not read config file {}: {}", path, e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(host) = env::var("FEEDERLINK_MQTT_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = env::var("FEEDERLINK_MQTT_PORT") {
            match port.parse() {
                Ok(p) => self.broker.port = p,
                Err(_) => warn!("Ignoring non-numeric FEEDERLINK_MQTT_PORT: {}", port),
            }
        }
        if let Ok(user) = env::var("FEEDERLINK_MQTT_USER") {
            self.broker.username = user;
        }
        if let Ok(pw) = env::var("FEEDERLINK_MQTT_PASSWORD") {
            self.broker.password = pw;
        }
        if let Ok(url) = env::var("FEEDERLINK_IMAGE_WS_URL") {
            self.image_stream.url = url;
        }
        if let Ok(url) = env::var("FEEDERLINK_API_URL") {
            self.api.base_url = url;
        }
    }
}

/// The fixed topic surface of the rig.
pub mod topics {
    /// Instantaneous weight telemetry from the scale.
    pub const WEIGHT: &str = "weight/1";
    /// Device-side maintenance status notes.
    pub const MAINTENANCE_STATUS: &str = "feeder/maintenance_status";

    /// Dispense-run start command.
    pub const FEEDER_START: &str = "weight/subscribe";
    /// Tare the scale.
    pub const TARE: &str = "feeder/tare";
    /// Kick off tray calibration on the device.
    pub const CALIBRATION_REQUEST: &str = "feeder/calibration_request";
    /// Confirm an automatic calibration result.
    pub const CALIBRATION_CONFIRM: &str = "feeder/calibration_confirm";
    /// Request a maintenance pass.
    pub const MAINTENANCE_REQUEST: &str = "feeder/maintenance_request";

    pub const COMMANDS: &[&str] = &[
        FEEDER_START,
        TARE,
        CALIBRATION_REQUEST,
        CALIBRATION_CONFIRM,
        MAINTENANCE_REQUEST,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_fixed_topic_surface() {
        let config = Config::default();
        assert!(config
            .broker
            .subscriptions
            .contains(&topics::WEIGHT.to_string()));
        assert_eq!(config.broker.command_topics.len(), topics::COMMANDS.len());
        assert_eq!(config.broker.url(), "wss://mqttbroker.bc-pl.com:443/mqtt");
    }

    #[test]
    fn toml_override_merges_over_defaults() {
        let raw = r#"
            [broker]
            host = "broker.local"
            auto_reconnect = false

            [image_stream]
            url = "ws://cam.local/ws/"
        "#;
        let config: Config = toml::from_str(raw).expect("valid toml");
        assert_eq!(config.broker.host, "broker.local");
        assert!(!config.broker.auto_reconnect);
        // untouched sections keep their defaults
        assert_eq!(config.broker.port, 443);
        assert_eq!(config.image_stream.url, "ws://cam.local/ws/");
        assert_eq!(config.image_stream.ping_interval_secs, 30);
    }
}
