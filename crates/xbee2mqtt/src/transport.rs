// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport seams of the bridge engine.
//!
//! The engine publishes through [`PubSub`] and writes radio frames through
//! [`FrameWriter`]. Production implementations wrap an MQTT client and a
//! serial port; tests substitute in-memory fakes.

use crate::config::Qos;
use crate::framing::{self, FramingError};
use parking_lot::Mutex;
use std::io::Write;
use thiserror::Error;

/// Transport failures reported to the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("serial write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("cannot frame request: {0}")]
    Framing(#[from] FramingError),
}

/// Message broker side of the bridge.
pub trait PubSub: Send + Sync {
    /// Queue a publication. Must not block on network round-trips.
    fn publish(&self, topic: &str, payload: &str, qos: Qos, retain: bool)
        -> Result<(), TransportError>;

    /// Subscribe to a set of topic filters.
    fn subscribe(&self, filters: &[String]) -> Result<(), TransportError>;
}

/// Radio side of the bridge: accepts unframed API frame bodies.
pub trait FrameWriter: Send + Sync {
    fn write_frame(&self, body: &[u8]) -> Result<(), TransportError>;
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// [`PubSub`] over an `rumqttc` client.
///
/// Requests are queued to the client's event loop without awaiting it, so
/// the engine can call in from the serial reader thread.
#[derive(Clone)]
pub struct MqttPublisher {
    client: rumqttc::AsyncClient,
    subscribe_qos: Qos,
}

impl MqttPublisher {
    pub fn new(client: rumqttc::AsyncClient, subscribe_qos: Qos) -> Self {
        Self {
            client,
            subscribe_qos,
        }
    }
}

impl PubSub for MqttPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos.into(), retain, payload.as_bytes().to_vec())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, filters: &[String]) -> Result<(), TransportError> {
        for filter in filters {
            self.client
                .try_subscribe(filter.as_str(), self.subscribe_qos.into())
                .map_err(|e| TransportError::Subscribe {
                    topic: filter.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// [`FrameWriter`] over a serial port, applying API framing.
pub struct SerialWriter<W: Write + Send> {
    port: Mutex<W>,
    escaped: bool,
}

impl<W: Write + Send> SerialWriter<W> {
    pub fn new(port: W, escaped: bool) -> Self {
        Self {
            port: Mutex::new(port),
            escaped,
        }
    }
}

impl<W: Write + Send> FrameWriter for SerialWriter<W> {
    fn write_frame(&self, body: &[u8]) -> Result<(), TransportError> {
        let wire = framing::encode(body, self.escaped)?;
        let mut port = self.port.lock();
        port.write_all(&wire)?;
        port.flush()?;
        Ok(())
    }
}

/// [`PubSub`] printing `topic payload` lines, for console mode.
#[derive(Debug, Default)]
pub struct ConsolePubSub;

impl PubSub for ConsolePubSub {
    fn publish(
        &self,
        topic: &str,
        payload: &str,
        _qos: Qos,
        _retain: bool,
    ) -> Result<(), TransportError> {
        println!("{} {}", topic, payload);
        Ok(())
    }

    fn subscribe(&self, _filters: &[String]) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_writer_frames_body() {
        let writer = SerialWriter::new(Vec::new(), false);
        writer.write_frame(&[0x08, 0x01, 0x4e, 0x4a]).expect("write");
        let wire = writer.port.lock().clone();
        assert_eq!(hex::encode(wire), "7e000408014e4a5e");
    }

    #[test]
    fn test_serial_writer_escaped_mode() {
        let writer = SerialWriter::new(Vec::new(), true);
        writer.write_frame(&[0x10, 0x7e]).expect("write");
        let wire = writer.port.lock().clone();
        assert_eq!(wire[0], framing::START_DELIMITER);
        assert!(!wire[1..].contains(&framing::START_DELIMITER));
    }

    #[test]
    fn test_serial_writer_refuses_oversize_body() {
        let writer = SerialWriter::new(Vec::new(), false);
        let body = vec![0x10; framing::MAX_BODY_SIZE + 1];
        assert!(matches!(
            writer.write_frame(&body),
            Err(TransportError::Framing(FramingError::Oversize(_)))
        ));
        assert!(writer.port.lock().is_empty());
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(rumqttc::QoS::from(Qos::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(Qos::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }
}
