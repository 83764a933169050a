// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XBee to MQTT gateway
//!
//! Bridges an XBee radio mesh, attached over a serial port in API mode, to an
//! MQTT broker.
//!
//! # Features
//!
//! - **Frame Decoding**: receive packets (`port:value` text), explicit
//!   receives, IO samples and forced-sample responses become readings
//! - **Routing**: per (address, port) topic templates with wildcards and a
//!   configurable default pattern
//! - **Filters**: scale, round, map, threshold and invert per route
//! - **Duplicate Suppression**: identical values are published once per window
//! - **Set Commands**: messages on input topics drive digital lines or are
//!   sent to the node as text
//!
//! # Quick Start
//!
//! ```bash
//! # Generate a configuration file
//! xbee2mqtt gen-config --output xbee2mqtt.toml
//!
//! # Run the gateway
//! xbee2mqtt --config xbee2mqtt.toml
//!
//! # Print readings without a broker
//! xbee2mqtt --config xbee2mqtt.toml console
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [radio]
//! port = "/dev/ttyUSB0"
//! baudrate = 9600
//!
//! [mqtt]
//! host = "localhost"
//!
//! [[routes]]
//! address = "0013a20040401122"
//! port = "status"
//! topic = "/home/door/status"
//! filters = [{ type = "map", values = { "1" = "open", "0" = "closed" } }]
//! ```

pub mod config;
pub mod dedup;
pub mod engine;
pub mod filter;
pub mod frame;
pub mod framing;
pub mod reading;
pub mod route;
pub mod routing;
pub mod service;
pub mod template;
pub mod transport;

pub use config::{BridgeConfig, ConfigError, Qos, RouteConfig};
pub use dedup::{Clock, Deduplicator, ManualClock, SystemClock};
pub use engine::{BridgeEngine, BridgeError, BridgeState, Dispatch, EngineStatsSnapshot, Inbound};
pub use filter::{FilterError, FilterPipeline, FilterSpec};
pub use frame::{decode, DecodeError, DecoderConfig, FrameKind, OutboundFrame};
pub use reading::{Address, Reading, Value};
pub use route::{Route, RouteStats, RouteStatsSnapshot};
pub use routing::RoutingTable;
pub use transport::{FrameWriter, PubSub, TransportError};
