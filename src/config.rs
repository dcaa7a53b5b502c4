//! TOML-backed configuration for the bridge.
//!
//! Mirrors the teacher's data-stream config: `load`/`save` via
//! `toml::from_str`/`toml::to_string_pretty`, atomic write through a
//! temporary file, and `#[serde(default = ...)]` throughout so a partial
//! file is still valid.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_serial_port() -> String {
    "COM4".to_string()
}
fn default_baudrate() -> u32 {
    4800
}
fn default_serial_timeout_s() -> f64 {
    1.0
}
fn default_freshness_s() -> f64 {
    5.0
}
fn default_udp_host() -> String {
    "0.0.0.0".to_string()
}
fn default_udp_port() -> u16 {
    55278
}
fn default_buffer_bytes() -> usize {
    65535
}
fn default_ws_host() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    2992
}
fn default_ws_path() -> String {
    "/api/v1".to_string()
}
fn default_broadcast_interval_s() -> f64 {
    0.25
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,
    #[serde(default = "default_serial_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_serial_timeout_s")]
    pub timeout_s: f64,
    #[serde(default = "default_freshness_s")]
    pub freshness_s: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_serial_port(),
            baudrate: default_baudrate(),
            timeout_s: default_serial_timeout_s(),
            freshness_s: default_freshness_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub enabled: bool,
    #[serde(default = "default_udp_host")]
    pub host: String,
    #[serde(default = "default_udp_port")]
    pub port: u16,
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default = "default_freshness_s")]
    pub freshness_s: f64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_udp_host(),
            port: default_udp_port(),
            buffer_bytes: default_buffer_bytes(),
            freshness_s: default_freshness_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    #[serde(default = "default_ws_host")]
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default = "default_broadcast_interval_s")]
    pub broadcast_interval_s: f64,
    #[serde(default = "default_true")]
    pub compatibility_mode: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_ws_host(),
            port: default_ws_port(),
            path: default_ws_path(),
            broadcast_interval_s: default_broadcast_interval_s(),
            compatibility_mode: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub udp: UdpConfig,
    pub websocket: WebSocketConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(source),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize {
                source: Box::new(source),
            })?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, text).map_err(|source| ConfigError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validates field ranges, returning a map of section name to human
    /// readable messages. An empty map means the configuration is sound.
    pub fn validate(&self) -> std::collections::HashMap<String, Vec<String>> {
        let mut messages: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();

        if self.serial.timeout_s <= 0.0 {
            messages
                .entry("serial".to_string())
                .or_default()
                .push("timeout_s must be positive".to_string());
        }
        if self.udp.buffer_bytes == 0 || self.udp.buffer_bytes > 65535 {
            messages
                .entry("udp".to_string())
                .or_default()
                .push("buffer_bytes must be in 1..=65535".to_string());
        }
        if self.websocket.broadcast_interval_s <= 0.0 {
            messages
                .entry("websocket".to_string())
                .or_default()
                .push("broadcast_interval_s must be positive".to_string());
        }
        if !self.websocket.path.starts_with('/') {
            messages
                .entry("websocket".to_string())
                .or_default()
                .push("path should start with '/'".to_string());
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let config = Config::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("condor-bridge.toml");

        let mut config = Config::default();
        config.serial.port = "/dev/ttyUSB0".to_string();
        config.websocket.compatibility_mode = false;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.serial.port, "/dev/ttyUSB0");
        assert!(!loaded.websocket.compatibility_mode);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[udp]\nport = 9999\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.udp.port, 9999);
        assert_eq!(config.udp.host, "0.0.0.0");
        assert!(config.serial.enabled);
    }

    #[test]
    fn rejects_invalid_broadcast_interval() {
        let mut config = Config::default();
        config.websocket.broadcast_interval_s = 0.0;
        let messages = config.validate();
        assert!(messages.contains_key("websocket"));
    }
}
