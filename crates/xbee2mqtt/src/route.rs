// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Route definition and statistics.

use crate::config::{ConfigError, Qos, RouteConfig, WILDCARD};
use crate::filter::{FilterError, FilterPipeline};
use crate::reading::{Address, Value};
use crate::template::TopicTemplate;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Specificity class of a route. Lower classes win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    /// Exact address, exact port.
    Exact,
    /// Exact address, any port.
    Address,
    /// Any address, exact port.
    Port,
    /// The default route built from the general patterns.
    Default,
}

/// A mapping between (address, port) readings and MQTT topics.
#[derive(Debug)]
pub struct Route {
    /// Node address, `None` for any.
    pub address: Option<Address>,

    /// Port name, `None` for any.
    pub port: Option<String>,

    /// Output topic template.
    pub topic: TopicTemplate,

    /// Input ("set") topic template; `None` when the route is not exposed.
    pub input_topic: Option<TopicTemplate>,

    /// Filters applied to outgoing values.
    pub filters: FilterPipeline,

    /// Delivery overrides.
    pub qos: Option<Qos>,
    pub retain: Option<bool>,

    /// Route statistics.
    pub stats: Arc<RouteStats>,
}

impl Route {
    /// Create a route from configuration.
    ///
    /// `default_topic` is used when the route has no topic of its own.
    pub fn from_config(config: &RouteConfig, default_topic: &str) -> Result<Self, ConfigError> {
        let address = parse_matcher(&config.address, |s| {
            s.parse::<Address>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))
        })?;
        let port = parse_matcher(&config.port, |s| {
            if !crate::frame::is_port_label(s) || s.trim() != s {
                Err(ConfigError::Invalid(format!("invalid port name '{}'", s)))
            } else {
                Ok(s.to_string())
            }
        })?;

        if address.is_none() && port.is_none() {
            return Err(ConfigError::Invalid(
                "a route needs an exact address, an exact port or both; \
                 use the [general] patterns for the catch-all"
                    .into(),
            ));
        }

        let topic_raw = config.topic.as_deref().unwrap_or(default_topic);
        let topic = TopicTemplate::parse(topic_raw)?;
        let input_raw = config
            .input_topic
            .clone()
            .unwrap_or_else(|| format!("{}/set", topic_raw));
        let input_topic = TopicTemplate::parse(&input_raw)?;

        // A wildcard field must be recoverable from the input topic.
        if address.is_none() && !input_topic.has_address() {
            return Err(ConfigError::Invalid(format!(
                "input topic '{}' of a wildcard-address route needs {{address}}",
                input_topic
            )));
        }
        if port.is_none() && !input_topic.has_port() {
            return Err(ConfigError::Invalid(format!(
                "input topic '{}' of a wildcard-port route needs {{port}}",
                input_topic
            )));
        }

        let stats = Arc::new(RouteStats::new(label(address, port.as_deref())));
        Ok(Self {
            address,
            port,
            topic,
            input_topic: Some(input_topic),
            filters: FilterPipeline::new(config.filters.clone())?,
            qos: config.qos,
            retain: config.retain,
            stats,
        })
    }

    /// Catch-all route for readings no configured route covers.
    pub fn default_route(output: &str, input: Option<&str>) -> Result<Self, ConfigError> {
        let topic = TopicTemplate::parse(output)?;
        let input_topic = match input {
            Some(raw) => {
                let tpl = TopicTemplate::parse(raw)?;
                if !tpl.has_address() || !tpl.has_port() {
                    return Err(ConfigError::Invalid(format!(
                        "default input topic '{}' needs both {{address}} and {{port}}",
                        tpl
                    )));
                }
                Some(tpl)
            }
            None => None,
        };

        Ok(Self {
            address: None,
            port: None,
            topic,
            input_topic,
            filters: FilterPipeline::default(),
            qos: None,
            retain: None,
            stats: Arc::new(RouteStats::new(label(None, None))),
        })
    }

    pub fn specificity(&self) -> Specificity {
        match (self.address.is_some(), self.port.is_some()) {
            (true, true) => Specificity::Exact,
            (true, false) => Specificity::Address,
            (false, true) => Specificity::Port,
            (false, false) => Specificity::Default,
        }
    }

    pub fn is_default(&self) -> bool {
        self.specificity() == Specificity::Default
    }

    /// Check if this route covers a reading channel.
    pub fn covers(&self, address: Address, port: &str) -> bool {
        self.address.map_or(true, |a| a == address)
            && self.port.as_deref().map_or(true, |p| p == port)
    }

    /// Output topic for a reading channel.
    pub fn render_topic(&self, address: Address, port: &str) -> String {
        self.topic.render(address, port)
    }

    /// Input topic for a reading channel, if the route is exposed.
    pub fn render_input_topic(&self, address: Address, port: &str) -> Option<String> {
        self.input_topic
            .as_ref()
            .map(|tpl| tpl.render(address, port))
    }

    /// Parse a concrete input topic back into (address, port).
    ///
    /// Captured values must agree with the route's exact fields.
    pub fn parse_input_topic(&self, topic: &str) -> Option<(Address, String)> {
        let captured = self.input_topic.as_ref()?.captures(topic)?;

        let address = match (self.address, captured.address) {
            (Some(fixed), Some(text)) => {
                let parsed: Address = text.parse().ok()?;
                (parsed == fixed).then_some(fixed)?
            }
            (Some(fixed), None) => fixed,
            (None, Some(text)) => text.parse().ok()?,
            (None, None) => return None,
        };
        let port = match (self.port.as_deref(), captured.port) {
            (Some(fixed), Some(text)) => (text == fixed).then(|| text)?,
            (Some(fixed), None) => fixed.to_string(),
            (None, Some(text)) => text,
            (None, None) => return None,
        };

        Some((address, port))
    }

    /// Run the route's filters.
    pub fn apply_filters(&self, value: Value) -> Result<Value, FilterError> {
        self.filters.apply(value)
    }

    /// Record a published message.
    pub fn record_message(&self, bytes: u64) {
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a command written to the radio.
    pub fn record_command(&self) {
        self.stats.commands_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reading dropped by a filter.
    pub fn record_filtered(&self) {
        self.stats.messages_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error.
    pub fn record_error(&self) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
    }
}

fn parse_matcher<T>(
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    if raw == WILDCARD {
        Ok(None)
    } else if raw.is_empty() {
        Err(ConfigError::Invalid(
            "route address and port must not be empty (use '*')".into(),
        ))
    } else {
        parse(raw).map(Some)
    }
}

fn label(address: Option<Address>, port: Option<&str>) -> String {
    let address = address.map_or_else(|| WILDCARD.to_string(), |a| a.to_string());
    format!("{}:{}", address, port.unwrap_or(WILDCARD))
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.stats.label, self.topic)
    }
}

/// Statistics for a route.
#[derive(Debug)]
pub struct RouteStats {
    /// `address:port` matcher, `*` for wildcards.
    pub label: String,

    /// Messages published to the broker.
    pub messages_published: AtomicU64,

    /// Payload bytes published.
    pub bytes_published: AtomicU64,

    /// Readings dropped by a filter.
    pub messages_filtered: AtomicU64,

    /// Commands written to the radio.
    pub commands_written: AtomicU64,

    /// Errors encountered.
    pub errors: AtomicU64,

    /// Route creation time.
    pub created: Instant,
}

impl RouteStats {
    /// Create new stats.
    pub fn new(label: String) -> Self {
        Self {
            label,
            messages_published: AtomicU64::new(0),
            bytes_published: AtomicU64::new(0),
            messages_filtered: AtomicU64::new(0),
            commands_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            label: self.label.clone(),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            messages_filtered: self.messages_filtered.load(Ordering::Relaxed),
            commands_written: self.commands_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of route statistics.
#[derive(Debug, Clone)]
pub struct RouteStatsSnapshot {
    pub label: String,
    pub messages_published: u64,
    pub bytes_published: u64,
    pub messages_filtered: u64,
    pub commands_written: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl RouteStatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_published as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}
