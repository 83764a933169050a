// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic templates with `{address}` and `{port}` placeholders.
//!
//! A template renders a concrete topic for a reading and, in reverse, parses
//! a concrete topic back into its placeholder values. Malformed templates are
//! rejected when the routing table is built.

use crate::config::ConfigError;
use crate::reading::Address;
use regex::Regex;
use std::fmt;

const ADDRESS_PLACEHOLDER: &str = "address";
const PORT_PLACEHOLDER: &str = "port";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Address,
    Port,
}

/// Placeholder values captured from a concrete topic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TemplateMatch {
    pub address: Option<String>,
    pub port: Option<String>,
}

/// Compiled topic template.
#[derive(Debug, Clone)]
pub struct TopicTemplate {
    raw: String,
    segments: Vec<Segment>,
    matcher: Regex,
}

impl PartialEq for TopicTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for TopicTemplate {}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TopicTemplate {
    /// Parse and validate a template.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid(format!("topic template '{}': {}", raw, reason));

        if raw.is_empty() {
            return Err(invalid("empty template"));
        }
        if raw.contains(['+', '#']) {
            return Err(invalid("MQTT wildcards are not allowed"));
        }

        let mut segments = Vec::new();
        let mut rest = raw;
        while !rest.is_empty() {
            match rest.find(['{', '}']) {
                None => {
                    segments.push(Segment::Literal(rest.to_string()));
                    break;
                }
                Some(pos) if rest.as_bytes()[pos] == b'}' => {
                    return Err(invalid("unbalanced '}'"));
                }
                Some(pos) => {
                    if pos > 0 {
                        segments.push(Segment::Literal(rest[..pos].to_string()));
                    }
                    let after = &rest[pos + 1..];
                    let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
                    let name = &after[..close];
                    let segment = match name {
                        ADDRESS_PLACEHOLDER => Segment::Address,
                        PORT_PLACEHOLDER => Segment::Port,
                        other => {
                            return Err(invalid(&format!("unknown placeholder '{{{}}}'", other)))
                        }
                    };
                    if segments.contains(&segment) {
                        return Err(invalid(&format!("placeholder '{{{}}}' used twice", name)));
                    }
                    if matches!(segments.last(), Some(Segment::Address | Segment::Port)) {
                        return Err(invalid("adjacent placeholders cannot be parsed back"));
                    }
                    segments.push(segment);
                    rest = &after[close + 1..];
                }
            }
        }

        let mut pattern = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Address => pattern.push_str("(?P<address>[^/]+)"),
                Segment::Port => pattern.push_str("(?P<port>[^/]+)"),
            }
        }
        pattern.push('$');
        let matcher = Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_address(&self) -> bool {
        self.segments.contains(&Segment::Address)
    }

    pub fn has_port(&self) -> bool {
        self.segments.contains(&Segment::Port)
    }

    /// Render a concrete topic.
    pub fn render(&self, address: Address, port: &str) -> String {
        let mut out = String::with_capacity(self.raw.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Address => out.push_str(&address.to_string()),
                Segment::Port => out.push_str(port),
            }
        }
        out
    }

    /// Match a concrete topic, returning the captured placeholder values.
    pub fn captures(&self, topic: &str) -> Option<TemplateMatch> {
        let caps = self.matcher.captures(topic)?;
        Some(TemplateMatch {
            address: caps.name(ADDRESS_PLACEHOLDER).map(|m| m.as_str().to_string()),
            port: caps.name(PORT_PLACEHOLDER).map(|m| m.as_str().to_string()),
        })
    }

    /// MQTT subscription filter covering every topic this template matches:
    /// levels holding a placeholder become `+`.
    pub fn subscription_filter(&self) -> String {
        if !self.has_address() && !self.has_port() {
            return self.raw.clone();
        }
        self.raw
            .split('/')
            .map(|level| if level.contains('{') { "+" } else { level })
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        "0013a20040401122".parse().expect("addr")
    }

    #[test]
    fn test_render_default_template() {
        let tpl = TopicTemplate::parse("/raw/xbee/{address}/{port}").expect("parse");
        assert_eq!(tpl.render(addr(), "status"), "/raw/xbee/0013a20040401122/status");
        assert!(tpl.has_address());
        assert!(tpl.has_port());
    }

    #[test]
    fn test_literal_template() {
        let tpl = TopicTemplate::parse("/home/door").expect("parse");
        assert_eq!(tpl.render(addr(), "status"), "/home/door");
        assert_eq!(tpl.captures("/home/door"), Some(TemplateMatch::default()));
        assert_eq!(tpl.captures("/home/door/set"), None);
        assert_eq!(tpl.subscription_filter(), "/home/door");
    }

    #[test]
    fn test_captures() {
        let tpl = TopicTemplate::parse("/raw/xbee/{address}/{port}/set").expect("parse");
        let m = tpl
            .captures("/raw/xbee/0013a20040401122/dio-4/set")
            .expect("match");
        assert_eq!(m.address.as_deref(), Some("0013a20040401122"));
        assert_eq!(m.port.as_deref(), Some("dio-4"));

        assert!(tpl.captures("/raw/xbee/0013a20040401122/dio-4").is_none());
        assert!(tpl.captures("/raw/xbee/0013a20040401122/a/b/set").is_none());
        assert!(tpl.captures("/raw/xbee//dio-4/set").is_none());
    }

    #[test]
    fn test_placeholder_inside_level() {
        let tpl = TopicTemplate::parse("/node-{address}/{port}.value").expect("parse");
        let topic = tpl.render(addr(), "temp");
        assert_eq!(topic, "/node-0013a20040401122/temp.value");
        let m = tpl.captures(&topic).expect("match");
        assert_eq!(m.address.as_deref(), Some("0013a20040401122"));
        assert_eq!(m.port.as_deref(), Some("temp"));
        assert_eq!(tpl.subscription_filter(), "/+/+");
    }

    #[test]
    fn test_literal_characters_are_escaped() {
        let tpl = TopicTemplate::parse("/a.b/{port}").expect("parse");
        assert!(tpl.captures("/axb/x").is_none());
        assert!(tpl.captures("/a.b/x").is_some());
    }

    #[test]
    fn test_subscription_filter() {
        let tpl = TopicTemplate::parse("/raw/xbee/{address}/{port}/set").expect("parse");
        assert_eq!(tpl.subscription_filter(), "/raw/xbee/+/+/set");
    }

    #[test]
    fn test_invalid_templates() {
        for raw in [
            "",
            "/raw/{addr}/x",
            "/raw/{address",
            "/raw/address}/x",
            "/raw/{address}{port}",
            "/raw/{port}/{port}",
            "/raw/+/x",
            "/raw/#",
        ] {
            assert!(TopicTemplate::parse(raw).is_err(), "should reject {:?}", raw);
        }
    }
}
