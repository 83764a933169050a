// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-route value filters.
//!
//! Filters are described in configuration as [`FilterSpec`]s, validated once
//! when the routing table is built, and applied in order to every value the
//! route publishes. They hold no state between invocations.

use crate::config::ConfigError;
use crate::reading::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Largest supported `round` precision.
pub const MAX_DECIMALS: u32 = 10;

/// Runtime filter failure. Drops the reading it was applied to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("{filter} filter needs a numeric value, got '{value}'")]
    NotNumeric { filter: &'static str, value: String },
}

/// Filter description as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterSpec {
    /// `value * factor + offset`.
    Scale {
        #[serde(default = "default_factor")]
        factor: f64,
        #[serde(default)]
        offset: f64,
    },

    /// Round to a number of decimals (0 yields an integer).
    Round {
        #[serde(default)]
        decimals: u32,
    },

    /// Lookup table keyed by the textual value.
    Map {
        values: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },

    /// `above` when value >= `at`, otherwise `below`.
    Threshold {
        at: f64,
        #[serde(default = "default_above")]
        above: i64,
        #[serde(default)]
        below: i64,
    },

    /// Digital inversion: zero becomes 1, anything else 0.
    Invert,
}

fn default_factor() -> f64 {
    1.0
}

fn default_above() -> i64 {
    1
}

impl FilterSpec {
    /// Filter name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scale { .. } => "scale",
            Self::Round { .. } => "round",
            Self::Map { .. } => "map",
            Self::Threshold { .. } => "threshold",
            Self::Invert => "invert",
        }
    }

    /// Check parameters; rejected specs abort the table build.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Scale { factor, offset } => {
                if !factor.is_finite() || !offset.is_finite() {
                    return Err(ConfigError::Invalid(
                        "scale filter needs finite factor and offset".into(),
                    ));
                }
            }
            Self::Round { decimals } => {
                if *decimals > MAX_DECIMALS {
                    return Err(ConfigError::Invalid(format!(
                        "round filter supports at most {} decimals, got {}",
                        MAX_DECIMALS, decimals
                    )));
                }
            }
            Self::Map { values, .. } => {
                if values.is_empty() {
                    return Err(ConfigError::Invalid("map filter has no values".into()));
                }
            }
            Self::Threshold { at, .. } => {
                if !at.is_finite() {
                    return Err(ConfigError::Invalid(
                        "threshold filter needs a finite 'at'".into(),
                    ));
                }
            }
            Self::Invert => {}
        }
        Ok(())
    }

    /// Apply this filter to one value.
    pub fn apply(&self, value: Value) -> Result<Value, FilterError> {
        match self {
            Self::Scale { factor, offset } => {
                let v = numeric(self.name(), &value)?;
                Ok(Value::Float(v * factor + offset))
            }
            Self::Round { decimals } => {
                let v = numeric(self.name(), &value)?;
                if *decimals == 0 {
                    Ok(Value::Int(v.round() as i64))
                } else {
                    let scale = 10f64.powi(*decimals as i32);
                    Ok(Value::Float((v * scale).round() / scale))
                }
            }
            Self::Map { values, default } => {
                let key = value.to_string();
                match values.get(key.trim()) {
                    Some(mapped) => Ok(Value::Text(mapped.clone())),
                    None => Ok(default.clone().map(Value::Text).unwrap_or(value)),
                }
            }
            Self::Threshold { at, above, below } => {
                let v = numeric(self.name(), &value)?;
                Ok(Value::Int(if v >= *at { *above } else { *below }))
            }
            Self::Invert => {
                let v = numeric(self.name(), &value)?;
                Ok(Value::Int(if v == 0.0 { 1 } else { 0 }))
            }
        }
    }
}

fn numeric(filter: &'static str, value: &Value) -> Result<f64, FilterError> {
    value.as_f64().ok_or_else(|| FilterError::NotNumeric {
        filter,
        value: value.to_string(),
    })
}

/// Ordered chain of validated filters owned by one route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPipeline {
    filters: Vec<FilterSpec>,
}

impl FilterPipeline {
    /// Validate and compile a filter chain.
    pub fn new(specs: Vec<FilterSpec>) -> Result<Self, ConfigError> {
        for spec in &specs {
            spec.validate()?;
        }
        Ok(Self { filters: specs })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Run the chain; each filter receives the previous output.
    pub fn apply(&self, raw: Value) -> Result<Value, FilterError> {
        self.filters
            .iter()
            .try_fold(raw, |value, filter| filter.apply(value))
    }
}
