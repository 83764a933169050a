// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core bridge engine.
//!
//! The engine sits between the radio and the broker. Decoded readings go
//! through route resolution, duplicate suppression and filters before being
//! published; "set" messages from the broker are resolved back to a node
//! channel and written to the radio.
//!
//! All entry points take `&self`: the serial reader thread and the MQTT event
//! loop drive the same `Arc<BridgeEngine>` concurrently.

use crate::config::{BridgeConfig, ConfigError, Qos};
use crate::dedup::{Clock, Deduplicator, SystemClock};
use crate::filter::FilterError;
use crate::frame::{
    self, DecodeError, DecoderConfig, FrameKind, OutboundFrame, ANALOG_PREFIX, DIGITAL_PREFIX,
    HEADER_SIZE,
};
use crate::reading::{Address, Reading};
use crate::route::RouteStatsSnapshot;
use crate::routing::RoutingTable;
use crate::transport::{FrameWriter, PubSub, TransportError};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Digital lines monitored when change detection is enabled (DIO0..DIO12).
const CHANGE_DETECTION_MASK: u16 = 0x1FFF;

/// Pin levels for the `D<n>` / `P<n>` commands.
const PIN_OUTPUT_HIGH: u8 = 0x05;
const PIN_OUTPUT_LOW: u8 = 0x04;

/// Engine errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid payload for port '{port}': {reason}")]
    InvalidPayload { port: String, reason: String },
}

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Connecting,
    Running,
    Disconnected,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Outcome of handling one radio frame.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Readings decoded from the frame.
    pub readings: usize,
    /// Readings published.
    pub published: usize,
    /// Readings suppressed as duplicates.
    pub suppressed: usize,
    /// Readings without a route (undefined topics not published).
    pub dropped: usize,
    /// Per-reading filter and transport failures.
    pub failures: Vec<BridgeError>,
}

/// Outcome of handling one inbound MQTT message.
#[derive(Debug)]
pub enum Inbound {
    /// Topic does not resolve to any exposed route.
    Ignored,
    /// A frame was written to the radio.
    Written {
        address: Address,
        port: String,
        frame: OutboundFrame,
    },
}

/// Discovery behaviour on (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Discovery {
    on_connect: bool,
    sample_rate_ms: u16,
    change_detection: bool,
}

/// Everything derived from a configuration that a reload swaps at once.
#[derive(Debug)]
struct Compiled {
    table: RoutingTable,
    decoder: DecoderConfig,
    qos: Qos,
    retain: bool,
    dedup_window: Duration,
    discovery: Discovery,
}

impl Compiled {
    fn build(config: &BridgeConfig) -> Result<Self, ConfigError> {
        let general = &config.general;
        let sample_rate_ms = u16::try_from(general.sample_rate_ms).map_err(|_| {
            ConfigError::Invalid(format!(
                "general.sample_rate_ms must be <= {}",
                u16::MAX
            ))
        })?;

        Ok(Self {
            table: RoutingTable::build(config)?,
            decoder: DecoderConfig {
                default_port: general.default_port_name.clone(),
                adc_bits: config.radio.adc_bits,
            },
            qos: config.mqtt.qos,
            retain: config.mqtt.retain,
            dedup_window: Duration::from_secs(general.duplicate_check_window),
            discovery: Discovery {
                on_connect: general.discovery_on_connect,
                sample_rate_ms,
                change_detection: general.change_detection,
            },
        })
    }
}

/// Engine counters.
#[derive(Debug)]
pub struct EngineStats {
    pub frames_received: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub frames_unknown: AtomicU64,
    pub frames_ignored: AtomicU64,
    pub readings_decoded: AtomicU64,
    pub readings_suppressed: AtomicU64,
    pub readings_dropped: AtomicU64,
    pub filter_errors: AtomicU64,
    pub messages_published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub inbound_received: AtomicU64,
    pub inbound_ignored: AtomicU64,
    pub inbound_rejected: AtomicU64,
    pub frames_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub remote_at_failures: AtomicU64,
    pub created: Instant,
}

impl EngineStats {
    fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
            frames_unknown: AtomicU64::new(0),
            frames_ignored: AtomicU64::new(0),
            readings_decoded: AtomicU64::new(0),
            readings_suppressed: AtomicU64::new(0),
            readings_dropped: AtomicU64::new(0),
            filter_errors: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            inbound_received: AtomicU64::new(0),
            inbound_ignored: AtomicU64::new(0),
            inbound_rejected: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            remote_at_failures: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            frames_received: get(&self.frames_received),
            frames_malformed: get(&self.frames_malformed),
            frames_unknown: get(&self.frames_unknown),
            frames_ignored: get(&self.frames_ignored),
            readings_decoded: get(&self.readings_decoded),
            readings_suppressed: get(&self.readings_suppressed),
            readings_dropped: get(&self.readings_dropped),
            filter_errors: get(&self.filter_errors),
            messages_published: get(&self.messages_published),
            publish_errors: get(&self.publish_errors),
            inbound_received: get(&self.inbound_received),
            inbound_ignored: get(&self.inbound_ignored),
            inbound_rejected: get(&self.inbound_rejected),
            frames_written: get(&self.frames_written),
            write_errors: get(&self.write_errors),
            remote_at_failures: get(&self.remote_at_failures),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub frames_unknown: u64,
    pub frames_ignored: u64,
    pub readings_decoded: u64,
    pub readings_suppressed: u64,
    pub readings_dropped: u64,
    pub filter_errors: u64,
    pub messages_published: u64,
    pub publish_errors: u64,
    pub inbound_received: u64,
    pub inbound_ignored: u64,
    pub inbound_rejected: u64,
    pub frames_written: u64,
    pub write_errors: u64,
    pub remote_at_failures: u64,
    pub uptime_secs: u64,
}

/// The bridge engine.
pub struct BridgeEngine {
    compiled: ArcSwap<Compiled>,
    dedup: ArcSwap<Deduplicator>,
    clock: Arc<dyn Clock>,
    pubsub: Arc<dyn PubSub>,
    writer: Arc<dyn FrameWriter>,
    state: Mutex<BridgeState>,
    frame_id: AtomicU8,
    stats: EngineStats,
}

impl fmt::Debug for BridgeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeEngine")
            .field("state", &*self.state.lock())
            .field("routes", &self.compiled.load().table.routes().len())
            .finish_non_exhaustive()
    }
}

impl BridgeEngine {
    /// Create an engine in the `Stopped` state.
    pub fn new(
        config: &BridgeConfig,
        pubsub: Arc<dyn PubSub>,
        writer: Arc<dyn FrameWriter>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, pubsub, writer, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(
        config: &BridgeConfig,
        pubsub: Arc<dyn PubSub>,
        writer: Arc<dyn FrameWriter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let compiled = Compiled::build(config)?;
        let dedup = Deduplicator::new(compiled.dedup_window);

        tracing::info!(
            "Bridge engine created with {} route(s), undefined topics published={} exposed={}",
            compiled.table.routes().len(),
            compiled.table.publish_undefined(),
            compiled.table.expose_undefined()
        );

        Ok(Self {
            compiled: ArcSwap::from_pointee(compiled),
            dedup: ArcSwap::from_pointee(dedup),
            clock,
            pubsub,
            writer,
            state: Mutex::new(BridgeState::Stopped),
            frame_id: AtomicU8::new(1),
            stats: EngineStats::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        *self.state.lock()
    }

    fn transition(&self, from: &[BridgeState], to: BridgeState) -> BridgeState {
        let mut state = self.state.lock();
        if from.contains(&state) && *state != to {
            tracing::debug!("Bridge state {} -> {}", *state, to);
            *state = to;
        }
        *state
    }

    /// Stopped -> Connecting.
    pub fn start(&self) -> BridgeState {
        self.transition(&[BridgeState::Stopped], BridgeState::Connecting)
    }

    /// Disconnected -> Connecting, before a reconnect attempt.
    pub fn begin_connect(&self) -> BridgeState {
        self.transition(&[BridgeState::Disconnected], BridgeState::Connecting)
    }

    /// Broker session established: subscribe and run discovery.
    ///
    /// Subscription and discovery are both attempted; the first failure is
    /// returned.
    pub fn on_transport_connected(&self) -> Result<(), BridgeError> {
        let state = self.transition(
            &[BridgeState::Connecting, BridgeState::Disconnected],
            BridgeState::Running,
        );
        if state != BridgeState::Running {
            tracing::debug!("Ignoring connect notification while {}", state);
            return Ok(());
        }

        // Discovery republishes current values, so forget what was sent.
        self.dedup.load().clear();

        let compiled = self.compiled.load();
        let filters = compiled.table.subscriptions();
        let subscribed = self.pubsub.subscribe(&filters).map_err(BridgeError::from);
        match &subscribed {
            Ok(()) => tracing::info!("Subscribed to {} topic filter(s)", filters.len()),
            Err(e) => tracing::warn!("Subscription failed: {}", e),
        }

        let discovered = if compiled.discovery.on_connect {
            self.discover()
        } else {
            Ok(())
        };

        subscribed.and(discovered)
    }

    /// Broker session lost.
    pub fn on_transport_disconnected(&self) -> BridgeState {
        self.transition(
            &[BridgeState::Running, BridgeState::Connecting],
            BridgeState::Disconnected,
        )
    }

    /// Stop handling frames and messages.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state != BridgeState::Stopped {
            tracing::info!("Bridge engine stopped");
            *state = BridgeState::Stopped;
        }
    }

    fn is_stopped(&self) -> bool {
        self.state() == BridgeState::Stopped
    }

    /// Broadcast the discovery requests: optional sample rate and change
    /// detection settings, then a forced sample.
    pub fn discover(&self) -> Result<(), BridgeError> {
        let discovery = self.compiled.load().discovery.clone();

        let mut requests = Vec::with_capacity(3);
        if discovery.sample_rate_ms > 0 {
            requests.push(OutboundFrame::remote_at(
                Address::BROADCAST,
                "IR",
                discovery.sample_rate_ms.to_be_bytes().to_vec(),
            ));
        }
        if discovery.change_detection {
            requests.push(OutboundFrame::remote_at(
                Address::BROADCAST,
                "IC",
                CHANGE_DETECTION_MASK.to_be_bytes().to_vec(),
            ));
        }
        requests.push(OutboundFrame::remote_at(Address::BROADCAST, "IS", Vec::new()));

        tracing::info!("Broadcasting discovery ({} request(s))", requests.len());
        for request in &requests {
            self.write(request)?;
        }
        Ok(())
    }

    fn next_frame_id(&self) -> u8 {
        loop {
            let id = self.frame_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn write(&self, request: &OutboundFrame) -> Result<(), BridgeError> {
        let body = request.encode(self.next_frame_id());
        match self.writer.write_frame(&body) {
            Ok(()) => {
                bump(&self.stats.frames_written);
                Ok(())
            }
            Err(e) => {
                bump(&self.stats.write_errors);
                tracing::warn!("Radio write to {} failed: {}", request.destination(), e);
                Err(e.into())
            }
        }
    }

    /// Handle one de-framed radio frame.
    ///
    /// Returns `Err` only for malformed frames; per-reading failures are
    /// collected in the returned [`Dispatch`].
    pub fn handle_frame(&self, frame: &[u8]) -> Result<Dispatch, BridgeError> {
        let mut dispatch = Dispatch::default();
        if self.is_stopped() {
            bump(&self.stats.frames_ignored);
            return Ok(dispatch);
        }
        bump(&self.stats.frames_received);

        let compiled = self.compiled.load();
        let readings = match frame::decode(frame, &compiled.decoder) {
            Ok(readings) => readings,
            Err(e) => {
                bump(&self.stats.frames_malformed);
                tracing::warn!("Dropping frame: {}", e);
                return Err(e.into());
            }
        };

        if frame.len() >= HEADER_SIZE && FrameKind::from_u8(frame[0]).is_none() {
            bump(&self.stats.frames_unknown);
            tracing::debug!("Ignoring frame type 0x{:02x}", frame[0]);
        }
        if let Some(status) = frame::remote_at_status(frame).filter(|s| !s.is_ok()) {
            bump(&self.stats.remote_at_failures);
            tracing::warn!(
                "Remote AT {} on {} failed with status {}",
                status.command_str(),
                status.address,
                status.status
            );
        }

        dispatch.readings = readings.len();
        let dedup = self.dedup.load();
        for reading in readings {
            bump(&self.stats.readings_decoded);
            self.route_reading(&compiled, &dedup, reading, &mut dispatch);
        }

        Ok(dispatch)
    }

    fn route_reading(
        &self,
        compiled: &Compiled,
        dedup: &Deduplicator,
        reading: Reading,
        dispatch: &mut Dispatch,
    ) {
        let Reading {
            address,
            port,
            value,
            ..
        } = reading;

        let Some(route) = compiled.table.resolve_outbound(address, &port) else {
            bump(&self.stats.readings_dropped);
            dispatch.dropped += 1;
            tracing::debug!("No route for {}:{}, dropped", address, port);
            return;
        };

        if !dedup.should_publish((address, port.clone()), &value, self.clock.now()) {
            bump(&self.stats.readings_suppressed);
            dispatch.suppressed += 1;
            tracing::trace!("Suppressed duplicate {}:{} = {}", address, port, value);
            return;
        }

        let value = match route.apply_filters(value) {
            Ok(value) => value,
            Err(e) => {
                bump(&self.stats.filter_errors);
                route.record_filtered();
                tracing::warn!("Filter on route {} rejected {}:{}: {}", route, address, port, e);
                dispatch.failures.push(e.into());
                return;
            }
        };

        let topic = route.render_topic(address, &port);
        let payload = value.to_string();
        let qos = route.qos.unwrap_or(compiled.qos);
        let retain = route.retain.unwrap_or(compiled.retain);

        match self.pubsub.publish(&topic, &payload, qos, retain) {
            Ok(()) => {
                bump(&self.stats.messages_published);
                route.record_message(payload.len() as u64);
                dispatch.published += 1;
                tracing::debug!("Published {} = {}", topic, payload);
            }
            Err(e) => {
                bump(&self.stats.publish_errors);
                route.record_error();
                tracing::warn!("Publish to {} failed: {}", topic, e);
                dispatch.failures.push(e.into());
            }
        }
    }

    /// Handle one message received on a subscribed topic.
    pub fn handle_inbound_message(&self, topic: &str, payload: &[u8]) -> Result<Inbound, BridgeError> {
        if self.is_stopped() {
            return Ok(Inbound::Ignored);
        }
        bump(&self.stats.inbound_received);

        let compiled = self.compiled.load();
        let Some((address, port, route)) = compiled.table.resolve_inbound(topic) else {
            bump(&self.stats.inbound_ignored);
            tracing::debug!("Ignoring message on unrouted topic {}", topic);
            return Ok(Inbound::Ignored);
        };

        let request = match encode_set(address, &port, payload, &compiled.decoder.default_port) {
            Ok(request) => request,
            Err(e) => {
                bump(&self.stats.inbound_rejected);
                route.record_error();
                tracing::warn!("Rejected message on {}: {}", topic, e);
                return Err(e);
            }
        };

        if let Err(e) = self.write(&request) {
            route.record_error();
            return Err(e);
        }
        route.record_command();
        tracing::debug!("Wrote {:?} for {}:{}", request, address, port);

        Ok(Inbound::Written {
            address,
            port,
            frame: request,
        })
    }

    /// Rebuild the routing table from a new configuration and swap it in.
    ///
    /// On error the current table stays active.
    pub fn reload(&self, config: &BridgeConfig) -> Result<(), ConfigError> {
        let compiled = Compiled::build(config)?;
        let previous = self.compiled.load_full();

        if compiled.dedup_window != previous.dedup_window {
            self.dedup
                .store(Arc::new(Deduplicator::new(compiled.dedup_window)));
        }

        let old_filters = previous.table.subscriptions();
        let new_filters: Vec<String> = compiled
            .table
            .subscriptions()
            .into_iter()
            .filter(|f| !old_filters.contains(f))
            .collect();
        let routes = compiled.table.routes().len();
        self.compiled.store(Arc::new(compiled));

        if self.state() == BridgeState::Running && !new_filters.is_empty() {
            if let Err(e) = self.pubsub.subscribe(&new_filters) {
                tracing::warn!("Subscription after reload failed: {}", e);
            }
        }

        tracing::info!("Configuration reloaded with {} route(s)", routes);
        Ok(())
    }

    /// Forget duplicate-suppression entries whose window has elapsed.
    pub fn evict_expired_dedup(&self) -> usize {
        let evicted = self.dedup.load().evict_expired(self.clock.now());
        if evicted > 0 {
            tracing::trace!("Evicted {} expired dedup entries", evicted);
        }
        evicted
    }

    /// Engine counters.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-route counters, default route last.
    pub fn route_stats(&self) -> Vec<RouteStatsSnapshot> {
        self.compiled
            .load()
            .table
            .all_routes()
            .map(|route| route.stats.snapshot())
            .collect()
    }
}

/// Translate a "set" payload into a radio request for the channel.
fn encode_set(
    address: Address,
    port: &str,
    payload: &[u8],
    default_port: &str,
) -> Result<OutboundFrame, BridgeError> {
    let invalid = |reason: &str| BridgeError::InvalidPayload {
        port: port.to_string(),
        reason: reason.to_string(),
    };

    let text = std::str::from_utf8(payload).map_err(|_| invalid("not UTF-8"))?;
    if text.contains(['\r', '\n']) {
        return Err(invalid("line terminators are not allowed"));
    }

    if let Some(channel) = frame::io_channel(port, DIGITAL_PREFIX) {
        let command =
            frame::digital_pin_command(channel).ok_or_else(|| invalid("no such digital line"))?;
        let level = match text.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "true" | "high" => PIN_OUTPUT_HIGH,
            "0" | "off" | "false" | "low" => PIN_OUTPUT_LOW,
            _ => return Err(invalid("expected 1/0, on/off, true/false or high/low")),
        };
        return Ok(OutboundFrame::remote_at(address, &command, vec![level]));
    }

    if frame::io_channel(port, ANALOG_PREFIX).is_some() {
        return Err(invalid("analog inputs are read-only"));
    }

    if text.is_empty() {
        return Err(invalid("empty payload"));
    }
    let data = if port == default_port {
        format!("{}\n", text)
    } else {
        format!("{}:{}\n", port, text)
    };
    if data.len() > frame::MAX_RF_PAYLOAD {
        return Err(invalid(&format!(
            "{} bytes exceeds the {} byte radio payload limit",
            data.len(),
            frame::MAX_RF_PAYLOAD
        )));
    }
    Ok(OutboundFrame::Transmit {
        destination: address,
        data: data.into_bytes(),
    })
}
