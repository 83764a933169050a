// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing table: resolves readings to topics and "set" topics back to
//! (address, port).
//!
//! Routes are ordered by specificity class (exact address and port, exact
//! address, exact port) and then by configuration order. The default route
//! built from the `[general]` patterns comes last and only takes part when
//! undefined topics are published or exposed.

use crate::config::{BridgeConfig, ConfigError};
use crate::reading::Address;
use crate::route::Route;
use std::collections::BTreeSet;

/// Compiled, immutable routing table.
#[derive(Debug)]
pub struct RoutingTable {
    routes: Vec<Route>,
    default_route: Route,
    publish_undefined: bool,
    expose_undefined: bool,
}

impl RoutingTable {
    /// Build and validate a table from configuration.
    pub fn build(config: &BridgeConfig) -> Result<Self, ConfigError> {
        let general = &config.general;
        let default_output = general.default_output_topic_pattern.as_str();
        let expose_undefined = general.expose_undefined();

        let default_input = general.input_topic_pattern();
        let default_route = Route::default_route(
            default_output,
            expose_undefined.then_some(default_input.as_str()),
        )?;

        let mut routes = config
            .routes
            .iter()
            .enumerate()
            .map(|(i, rc)| {
                Route::from_config(rc, default_output).map_err(|e| match e {
                    ConfigError::Invalid(msg) => {
                        ConfigError::Invalid(format!("route #{}: {}", i + 1, msg))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Stable: configuration order is kept within a class.
        routes.sort_by_key(Route::specificity);

        check_duplicates(&routes)?;
        check_ambiguous_inputs(&routes)?;

        Ok(Self {
            routes,
            default_route,
            publish_undefined: general.publish_undefined_topics,
            expose_undefined,
        })
    }

    /// Configured routes in resolution order (default route excluded).
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn default_route(&self) -> &Route {
        &self.default_route
    }

    /// Every route including the default one.
    pub fn all_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().chain(std::iter::once(&self.default_route))
    }

    /// The route owning a channel, ignoring the undefined-topic flags.
    fn owner(&self, address: Address, port: &str) -> &Route {
        self.routes
            .iter()
            .find(|r| r.covers(address, port))
            .unwrap_or(&self.default_route)
    }

    /// Route for an outgoing reading; `None` drops it.
    pub fn resolve_outbound(&self, address: Address, port: &str) -> Option<&Route> {
        let route = self.owner(address, port);
        if route.is_default() && !self.publish_undefined {
            return None;
        }
        Some(route)
    }

    /// Resolve a concrete "set" topic to (address, port, route).
    ///
    /// A structural match only counts when the matched route also owns the
    /// resulting channel, so inbound resolution always agrees with outbound
    /// resolution.
    pub fn resolve_inbound(&self, topic: &str) -> Option<(Address, String, &Route)> {
        let candidates = self
            .routes
            .iter()
            .chain(self.expose_undefined.then_some(&self.default_route));

        for route in candidates {
            let Some((address, port)) = route.parse_input_topic(topic) else {
                continue;
            };
            if std::ptr::eq(self.owner(address, &port), route) {
                return Some((address, port, route));
            }
        }
        None
    }

    /// MQTT subscription filters covering every exposed input topic.
    pub fn subscriptions(&self) -> Vec<String> {
        let exposed = self
            .routes
            .iter()
            .chain(self.expose_undefined.then_some(&self.default_route));

        exposed
            .filter_map(|r| r.input_topic.as_ref())
            .map(|tpl| tpl.subscription_filter())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn publish_undefined(&self) -> bool {
        self.publish_undefined
    }

    pub fn expose_undefined(&self) -> bool {
        self.expose_undefined
    }
}

fn check_duplicates(routes: &[Route]) -> Result<(), ConfigError> {
    for (i, a) in routes.iter().enumerate() {
        if let Some(b) = routes[i + 1..]
            .iter()
            .find(|b| b.address == a.address && b.port == a.port)
        {
            return Err(ConfigError::Invalid(format!(
                "duplicate route for {} ({} and {})",
                a.stats.label, a.topic, b.topic
            )));
        }
    }
    Ok(())
}

/// Two routes sharing an input template must be told apart by a placeholder.
fn check_ambiguous_inputs(routes: &[Route]) -> Result<(), ConfigError> {
    for (i, a) in routes.iter().enumerate() {
        let Some(tpl) = a.input_topic.as_ref() else {
            continue;
        };
        for b in &routes[i + 1..] {
            if b.input_topic.as_ref() != Some(tpl) {
                continue;
            }
            let address_clash = a.address != b.address && !tpl.has_address();
            let port_clash = a.port != b.port && !tpl.has_port();
            if address_clash || port_clash {
                return Err(ConfigError::Invalid(format!(
                    "routes {} and {} share input topic '{}' without a placeholder to tell them apart",
                    a.stats.label, b.stats.label, tpl
                )));
            }
        }
    }
    Ok(())
}
