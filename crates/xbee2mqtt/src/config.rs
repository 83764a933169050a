// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use crate::filter::FilterSpec;
use crate::routing::RoutingTable;
use crate::template::TopicTemplate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Wildcard accepted for route address and port matchers.
pub const WILDCARD: &str = "*";

/// MQTT quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("invalid qos {} (expected 0, 1 or 2)", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos as u8
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Statistics reporting interval (seconds, 0 to disable).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub radio: RadioConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Routes, in priority order within each specificity class.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
            general: GeneralConfig::default(),
            radio: RadioConfig::default(),
            mqtt: MqttConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, including a trial build of the routing table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=16).contains(&self.radio.adc_bits) {
            return Err(ConfigError::Invalid(format!(
                "radio.adc_bits must be between 1 and 16, got {}",
                self.radio.adc_bits
            )));
        }
        if self.radio.baudrate == 0 {
            return Err(ConfigError::Invalid("radio.baudrate must be > 0".into()));
        }
        if self.general.default_port_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "general.default_port_name must not be empty".into(),
            ));
        }
        if self.general.sample_rate_ms > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "general.sample_rate_ms must be <= {}",
                u16::MAX
            )));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.client_id must not be empty".into()));
        }
        if self.mqtt.keepalive != 0 && self.mqtt.keepalive < 5 {
            return Err(ConfigError::Invalid(
                "mqtt.keepalive must be 0 (disabled) or >= 5 seconds".into(),
            ));
        }
        if self.mqtt.set_will {
            TopicTemplate::parse(&self.mqtt.status_topic())?;
        }

        RoutingTable::build(self)?;
        Ok(())
    }

    /// Add a route.
    pub fn add_route(&mut self, route: RouteConfig) {
        self.routes.push(route);
    }
}

/// Bridge behaviour and default topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Output topic for readings without an explicit route.
    #[serde(default = "default_output_topic_pattern")]
    pub default_output_topic_pattern: String,

    /// Base of the default input pattern; defaults to the output pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_topic_pattern: Option<String>,

    /// Input ("set") topic; defaults to the base pattern + "/set".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_input_topic_pattern: Option<String>,

    /// Port assigned to text payloads without a `port:` label.
    #[serde(default = "default_port_name")]
    pub default_port_name: String,

    /// Duplicate suppression window in seconds (0 disables).
    #[serde(default = "default_duplicate_window")]
    pub duplicate_check_window: u64,

    /// Publish readings that only match the default route.
    #[serde(default = "default_true")]
    pub publish_undefined_topics: bool,

    /// Accept "set" commands through the default input pattern;
    /// defaults to `publish_undefined_topics`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose_undefined_topics: Option<bool>,

    /// Broadcast a discovery query whenever the broker connection comes up.
    #[serde(default = "default_true")]
    pub discovery_on_connect: bool,

    /// IO sample rate pushed to nodes during discovery (ms, 0 leaves nodes as is).
    #[serde(default)]
    pub sample_rate_ms: u64,

    /// Enable digital change detection on nodes during discovery.
    #[serde(default)]
    pub change_detection: bool,
}

fn default_output_topic_pattern() -> String {
    "/raw/xbee/{address}/{port}".to_string()
}

fn default_port_name() -> String {
    "serial".to_string()
}

fn default_duplicate_window() -> u64 {
    5
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_output_topic_pattern: default_output_topic_pattern(),
            default_topic_pattern: None,
            default_input_topic_pattern: None,
            default_port_name: default_port_name(),
            duplicate_check_window: default_duplicate_window(),
            publish_undefined_topics: true,
            expose_undefined_topics: None,
            discovery_on_connect: true,
            sample_rate_ms: 0,
            change_detection: false,
        }
    }
}

impl GeneralConfig {
    /// Effective default input pattern.
    pub fn input_topic_pattern(&self) -> String {
        self.default_input_topic_pattern.clone().unwrap_or_else(|| {
            let base = self
                .default_topic_pattern
                .as_deref()
                .unwrap_or(&self.default_output_topic_pattern);
            format!("{}/set", base)
        })
    }

    /// Effective "expose undefined topics" flag.
    pub fn expose_undefined(&self) -> bool {
        self.expose_undefined_topics
            .unwrap_or(self.publish_undefined_topics)
    }
}

/// Serial radio settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Serial device path.
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// API mode 2 (escaped) framing.
    #[serde(default)]
    pub escaped: bool,

    /// Significant bits of analog samples.
    #[serde(default = "default_adc_bits")]
    pub adc_bits: u8,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baudrate() -> u32 {
    9600
}

fn default_adc_bits() -> u8 {
    16
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baudrate: default_baudrate(),
            escaped: false,
            adc_bits: default_adc_bits(),
        }
    }
}

/// MQTT broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Start from a clean broker session on connect.
    #[serde(default)]
    pub clean_session: bool,

    /// Default QoS for publications.
    #[serde(default)]
    pub qos: Qos,

    /// Default retain flag for publications.
    #[serde(default = "default_true")]
    pub retain: bool,

    /// Service status topic; `{client_id}` is substituted.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,

    /// Register a last-will "0" on the status topic.
    #[serde(default = "default_true")]
    pub set_will: bool,

    /// Delay before reconnecting after a broker error (seconds).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "xbee2mqtt".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_status_topic() -> String {
    "/service/{client_id}/status".to_string()
}

fn default_reconnect_delay() -> u64 {
    3
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: false,
            qos: Qos::default(),
            retain: true,
            status_topic: default_status_topic(),
            set_will: true,
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl MqttConfig {
    /// Status topic with the client id substituted.
    pub fn status_topic(&self) -> String {
        self.status_topic.replace("{client_id}", &self.client_id)
    }

    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for a single route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Node address (16 hex digits) or `*`.
    #[serde(default = "wildcard")]
    pub address: String,

    /// Port name or `*`.
    #[serde(default = "wildcard")]
    pub port: String,

    /// Output topic template; defaults to the general output pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Input topic template; defaults to the output topic + "/set".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_topic: Option<String>,

    /// QoS override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<Qos>,

    /// Retain override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain: Option<bool>,

    /// Filters applied in order to published values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

impl RouteConfig {
    /// Create a new route.
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
            topic: None,
            input_topic: None,
            qos: None,
            retain: None,
            filters: Vec::new(),
        }
    }

    /// Set the output topic template.
    pub fn topic(mut self, template: impl Into<String>) -> Self {
        self.topic = Some(template.into());
        self
    }

    /// Set the input topic template.
    pub fn input_topic(mut self, template: impl Into<String>) -> Self {
        self.input_topic = Some(template.into());
        self
    }

    /// Append a filter.
    pub fn filter(mut self, spec: FilterSpec) -> Self {
        self.filters.push(spec);
        self
    }

    /// Override QoS and retain.
    pub fn delivery(mut self, qos: Qos, retain: bool) -> Self {
        self.qos = Some(qos);
        self.retain = Some(retain);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::parse("").expect("parse");
        assert_eq!(
            config.general.default_output_topic_pattern,
            "/raw/xbee/{address}/{port}"
        );
        assert_eq!(
            config.general.input_topic_pattern(),
            "/raw/xbee/{address}/{port}/set"
        );
        assert_eq!(config.general.default_port_name, "serial");
        assert_eq!(config.general.duplicate_check_window, 5);
        assert!(config.general.publish_undefined_topics);
        assert!(config.general.expose_undefined());
        assert!(config.general.discovery_on_connect);
        assert_eq!(config.radio.adc_bits, 16);
        assert_eq!(config.mqtt.broker_addr(), "localhost:1883");
        assert_eq!(config.mqtt.qos, Qos::AtMostOnce);
        assert!(config.mqtt.retain);
        assert!(!config.mqtt.clean_session);
        assert_eq!(config.mqtt.status_topic(), "/service/xbee2mqtt/status");
    }

    #[test]
    fn test_expose_follows_publish_flag() {
        let config = BridgeConfig::parse(
            r#"
            [general]
            publish_undefined_topics = false
            "#,
        )
        .expect("parse");
        assert!(!config.general.expose_undefined());

        let config = BridgeConfig::parse(
            r#"
            [general]
            publish_undefined_topics = false
            expose_undefined_topics = true
            "#,
        )
        .expect("parse");
        assert!(config.general.expose_undefined());
    }

    #[test]
    fn test_topic_pattern_seeds_input_only() {
        let config = BridgeConfig::parse(
            r#"
            [general]
            default_topic_pattern = "/xbee/{address}/{port}"
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.general.default_output_topic_pattern,
            "/raw/xbee/{address}/{port}"
        );
        assert_eq!(config.general.input_topic_pattern(), "/xbee/{address}/{port}/set");
    }

    #[test]
    fn test_output_and_base_patterns_together() {
        let config = BridgeConfig::parse(
            r#"
            [general]
            default_output_topic_pattern = "/out/{address}/{port}"
            default_topic_pattern = "/cmd/{address}/{port}"
            "#,
        )
        .expect("parse");
        assert_eq!(config.general.default_output_topic_pattern, "/out/{address}/{port}");
        assert_eq!(config.general.input_topic_pattern(), "/cmd/{address}/{port}/set");

        let explicit = BridgeConfig::parse(
            r#"
            [general]
            default_topic_pattern = "/cmd/{address}/{port}"
            default_input_topic_pattern = "/in/{address}/{port}"
            "#,
        )
        .expect("parse");
        assert_eq!(explicit.general.input_topic_pattern(), "/in/{address}/{port}");
    }

    #[test]
    fn test_routes_from_toml() {
        let config = BridgeConfig::parse(
            r#"
            [mqtt]
            qos = 1

            [[routes]]
            address = "0013a20040401122"
            port = "status"
            topic = "/home/door/status"
            retain = true
            filters = [{ type = "map", values = { "1" = "open", "0" = "closed" } }]

            [[routes]]
            port = "adc-7"
            topic = "/power/{address}/supply"
            "#,
        )
        .expect("parse");

        assert_eq!(config.mqtt.qos, Qos::AtLeastOnce);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].retain, Some(true));
        assert_eq!(config.routes[0].filters.len(), 1);
        assert_eq!(config.routes[1].address, WILDCARD);
        assert_eq!(config.routes[1].port, "adc-7");
    }

    #[test]
    fn test_invalid_values() {
        assert!(BridgeConfig::parse("[mqtt]\nqos = 3").is_err());
        assert!(BridgeConfig::parse("[radio]\nadc_bits = 0").is_err());
        assert!(BridgeConfig::parse("[radio]\nadc_bits = 17").is_err());
        assert!(BridgeConfig::parse("[mqtt]\nkeepalive = 2").is_err());
        assert!(BridgeConfig::parse("[general]\nsample_rate_ms = 70000").is_err());
        assert!(BridgeConfig::parse("[general]\ndefault_output_topic_pattern = \"/x/{nope}\"").is_err());
        assert!(BridgeConfig::parse(
            r#"
            [[routes]]
            address = "not-an-address"
            port = "status"
            "#
        )
        .is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
            log_level = "debug"

            [radio]
            port = "/dev/ttyAMA0"
            baudrate = 115200
            escaped = true
            "#
        )
        .expect("write");

        let config = BridgeConfig::from_file(file.path()).expect("load");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.radio.port, "/dev/ttyAMA0");
        assert_eq!(config.radio.baudrate, 115200);
        assert!(config.radio.escaped);
    }

    #[test]
    fn test_from_missing_file() {
        let err = BridgeConfig::from_file("/nonexistent/xbee2mqtt.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_route_config_builder() {
        let route = RouteConfig::new("0013a20040401122", "dio-4")
            .topic("/home/light")
            .input_topic("/home/light/switch")
            .filter(FilterSpec::Invert)
            .delivery(Qos::AtLeastOnce, true);

        assert_eq!(route.topic.as_deref(), Some("/home/light"));
        assert_eq!(route.input_topic.as_deref(), Some("/home/light/switch"));
        assert_eq!(route.filters.len(), 1);
        assert_eq!(route.qos, Some(Qos::AtLeastOnce));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = BridgeConfig::default();
        config.add_route(
            RouteConfig::new("0013a20040401122", "status")
                .topic("/home/door")
                .filter(FilterSpec::Invert),
        );

        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("default_port_name = \"serial\""));
        let parsed = BridgeConfig::parse(&toml_str).expect("reparse");
        assert_eq!(parsed, config);
    }
}
