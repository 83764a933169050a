// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Radio addresses, values and decoded readings.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

/// Error returned when parsing an [`Address`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid radio address '{0}' (expected 16 hex digits)")]
pub struct AddressParseError(pub String);

/// 64-bit hardware address of a radio node.
///
/// Rendered as 16 lowercase hex digits, e.g. `0013a20040401122`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    /// Broadcast address understood by every node of the mesh.
    pub const BROADCAST: Address = Address(0x0000_0000_0000_FFFF);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an address from the 8 big-endian bytes found in API frames.
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AddressParseError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| AddressParseError(s.to_string()))
    }
}

/// Value carried by a reading, before or after filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value. Text is accepted when it parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// One decoded observation from a remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub address: Address,
    /// Logical channel: a text label, the default port, `dio-<n>` or `adc-<n>`.
    pub port: String,
    pub value: Value,
    pub timestamp: SystemTime,
}

impl Reading {
    pub fn new(address: Address, port: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            address,
            port: port.into(),
            value: value.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// Key used for duplicate suppression.
    pub fn key(&self) -> (Address, String) {
        (self.address, self.port.clone())
    }
}
