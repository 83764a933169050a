// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// XBee API frame bodies: decoding of received frames into readings and
// encoding of outbound requests.
//
// Operates on de-framed bodies (frame type byte first). Start delimiter,
// length, checksum and escaping are handled in `framing`.
//
// Decoding never panics: a frame too short for its header is an error,
// everything past the header degrades gracefully.

use crate::reading::{Address, Reading, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while decoding a frame body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame shorter than the type byte plus the 64-bit source address.
    #[error("malformed frame: {len} bytes, header needs {needed}")]
    Malformed { len: usize, needed: usize },
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Frame type byte + 64-bit source address.
pub const HEADER_SIZE: usize = 9;

pub const FRAME_TRANSMIT_REQUEST: u8 = 0x10;
pub const FRAME_REMOTE_AT_COMMAND: u8 = 0x17;
pub const FRAME_RECEIVE_PACKET: u8 = 0x90;
pub const FRAME_EXPLICIT_RECEIVE: u8 = 0x91;
pub const FRAME_IO_SAMPLE: u8 = 0x92;
pub const FRAME_REMOTE_AT_RESPONSE: u8 = 0x97;

/// Largest transmit request payload the radio accepts, with fragmentation.
pub const MAX_RF_PAYLOAD: usize = 255;

/// Payload offset of a receive packet (type, addr64, addr16, options).
const RECEIVE_PAYLOAD_OFFSET: usize = 12;

/// Payload offset of an explicit receive (adds endpoints, cluster, profile).
const EXPLICIT_PAYLOAD_OFFSET: usize = 18;

/// Sample count byte of an IO sample (after addr16 + options).
const IO_SAMPLE_OFFSET: usize = 12;

/// Remote AT response: type, frame id, addr64, addr16, command, status.
const REMOTE_AT_RESPONSE_HEADER: usize = 15;

/// Remote AT status byte for a successful command.
const REMOTE_AT_OK: u8 = 0x00;

/// Command whose response carries a forced IO sample.
const FORCE_SAMPLE_COMMAND: &[u8; 2] = b"IS";

/// Remote AT option: apply changes immediately.
const REMOTE_AT_APPLY: u8 = 0x02;

/// 16-bit address used when only the 64-bit address is known.
const UNKNOWN_NETWORK_ADDRESS: [u8; 2] = [0xFF, 0xFE];

/// Channel prefixes for IO sample readings.
pub const DIGITAL_PREFIX: &str = "dio-";
pub const ANALOG_PREFIX: &str = "adc-";

// ---------------------------------------------------------------------------
// Frame kinds
// ---------------------------------------------------------------------------

/// Received frame types the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    ReceivePacket = FRAME_RECEIVE_PACKET,
    ExplicitReceive = FRAME_EXPLICIT_RECEIVE,
    IoSample = FRAME_IO_SAMPLE,
    RemoteAtResponse = FRAME_REMOTE_AT_RESPONSE,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            FRAME_RECEIVE_PACKET => Some(Self::ReceivePacket),
            FRAME_EXPLICIT_RECEIVE => Some(Self::ExplicitReceive),
            FRAME_IO_SAMPLE => Some(Self::IoSample),
            FRAME_REMOTE_AT_RESPONSE => Some(Self::RemoteAtResponse),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Offset of the 64-bit source address.
    fn address_offset(self) -> usize {
        match self {
            Self::RemoteAtResponse => 2,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decoder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Port used for text payloads without a `port:` label.
    pub default_port: String,
    /// Significant bits of an analog sample (1..=16).
    pub adc_bits: u8,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            default_port: "serial".to_string(),
            adc_bits: 16,
        }
    }
}

impl DecoderConfig {
    fn adc_mask(&self) -> u16 {
        match self.adc_bits {
            0 | 16..=u8::MAX => u16::MAX,
            bits => (1u16 << bits) - 1,
        }
    }
}

/// Decode one frame body into readings.
///
/// Unknown frame types yield an empty sequence, as do remote AT responses
/// other than a successful `IS` (force sample).
pub fn decode(frame: &[u8], config: &DecoderConfig) -> Result<Vec<Reading>, DecodeError> {
    if frame.len() < HEADER_SIZE {
        return Err(DecodeError::Malformed {
            len: frame.len(),
            needed: HEADER_SIZE,
        });
    }

    let Some(kind) = FrameKind::from_u8(frame[0]) else {
        return Ok(Vec::new());
    };

    let offset = kind.address_offset();
    let raw_address: [u8; 8] = frame
        .get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::Malformed {
            len: frame.len(),
            needed: offset + 8,
        })?;
    let address = Address::from_be_bytes(raw_address);

    let readings = match kind {
        FrameKind::ReceivePacket => {
            vec![decode_text(address, tail(frame, RECEIVE_PAYLOAD_OFFSET), config)]
        }
        FrameKind::ExplicitReceive => {
            vec![decode_text(address, tail(frame, EXPLICIT_PAYLOAD_OFFSET), config)]
        }
        FrameKind::IoSample => decode_io_sample(address, tail(frame, IO_SAMPLE_OFFSET), config),
        FrameKind::RemoteAtResponse => {
            let forced_sample = frame.get(12..14) == Some(FORCE_SAMPLE_COMMAND.as_slice())
                && frame.get(14) == Some(&REMOTE_AT_OK);
            if forced_sample {
                decode_io_sample(address, tail(frame, REMOTE_AT_RESPONSE_HEADER), config)
            } else {
                Vec::new()
            }
        }
    };

    Ok(readings)
}

fn tail(frame: &[u8], offset: usize) -> &[u8] {
    frame.get(offset..).unwrap_or(&[])
}

/// True if `label` can stand as one MQTT topic level.
pub fn is_port_label(label: &str) -> bool {
    !label.contains(['/', '+', '#'])
}

/// `port:value` text, or a bare value on the default port.
///
/// A label that is not a valid topic level makes the whole payload a bare
/// value.
fn decode_text(address: Address, payload: &[u8], config: &DecoderConfig) -> Reading {
    let text = String::from_utf8_lossy(payload);

    match text
        .split_once(':')
        .filter(|(port, _)| is_port_label(port))
    {
        Some((port, value)) => {
            let port = port.trim();
            let port = if port.is_empty() {
                config.default_port.as_str()
            } else {
                port
            };
            let value = value.trim_end_matches(['\r', '\n']);
            Reading::new(address, port, value)
        }
        None => Reading::new(address, config.default_port.as_str(), text.trim()),
    }
}

/// Decode an IO sample block starting at its sample count byte:
/// count | digital mask (u16) | analog mask | [digital word] | analog words.
fn decode_io_sample(address: Address, block: &[u8], config: &DecoderConfig) -> Vec<Reading> {
    let mut readings = Vec::new();

    let Some(masks) = block.get(1..4) else {
        return readings;
    };
    let digital_mask = u16::from_be_bytes([masks[0], masks[1]]);
    let analog_mask = masks[2];
    let mut cursor = 4;

    if digital_mask != 0 {
        let Some(sample) = block.get(cursor..cursor + 2) else {
            return readings;
        };
        let digital = u16::from_be_bytes([sample[0], sample[1]]);
        cursor += 2;

        for bit in (0..16).filter(|bit| digital_mask & (1 << bit) != 0) {
            let level = i64::from((digital >> bit) & 1);
            readings.push(Reading::new(
                address,
                format!("{}{}", DIGITAL_PREFIX, bit),
                Value::Int(level),
            ));
        }
    }

    let mask = config.adc_mask();
    for bit in (0..8).filter(|bit| analog_mask & (1 << bit) != 0) {
        let Some(sample) = block.get(cursor..cursor + 2) else {
            break;
        };
        let raw = u16::from_be_bytes([sample[0], sample[1]]) & mask;
        cursor += 2;
        readings.push(Reading::new(
            address,
            format!("{}{}", ANALOG_PREFIX, bit),
            Value::Int(i64::from(raw)),
        ));
    }

    readings
}

/// Status part of a remote AT command response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAtStatus {
    pub address: Address,
    pub frame_id: u8,
    pub command: [u8; 2],
    /// 0 = OK, 1 = error, 2 = invalid command, 3 = invalid parameter,
    /// 4 = transmission failure.
    pub status: u8,
}

impl RemoteAtStatus {
    pub fn is_ok(&self) -> bool {
        self.status == REMOTE_AT_OK
    }

    pub fn command_str(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }
}

/// Parse the status of a remote AT response frame, if `frame` is one.
pub fn remote_at_status(frame: &[u8]) -> Option<RemoteAtStatus> {
    if frame.first() != Some(&FRAME_REMOTE_AT_RESPONSE) {
        return None;
    }
    let address: [u8; 8] = frame.get(2..10)?.try_into().ok()?;
    let command: [u8; 2] = frame.get(12..14)?.try_into().ok()?;
    Some(RemoteAtStatus {
        address: Address::from_be_bytes(address),
        frame_id: frame[1],
        command,
        status: *frame.get(14)?,
    })
}

/// Parse a `dio-<n>` / `adc-<n>` port into its channel number.
pub fn io_channel(port: &str, prefix: &str) -> Option<u8> {
    port.strip_prefix(prefix)?.parse().ok()
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Outbound request addressed to a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Remote AT command (0x17).
    RemoteAt {
        destination: Address,
        command: [u8; 2],
        parameter: Vec<u8>,
    },
    /// Transmit request (0x10) carrying raw RF data.
    Transmit { destination: Address, data: Vec<u8> },
}

impl OutboundFrame {
    pub fn remote_at(destination: Address, command: &str, parameter: Vec<u8>) -> Self {
        let bytes = command.as_bytes();
        let mut cmd = [b' '; 2];
        for (slot, b) in cmd.iter_mut().zip(bytes) {
            *slot = *b;
        }
        Self::RemoteAt {
            destination,
            command: cmd,
            parameter,
        }
    }

    pub fn destination(&self) -> Address {
        match self {
            Self::RemoteAt { destination, .. } | Self::Transmit { destination, .. } => *destination,
        }
    }

    /// Serialize to a frame body. `frame_id` 0 disables the response frame.
    pub fn encode(&self, frame_id: u8) -> Vec<u8> {
        match self {
            Self::RemoteAt {
                destination,
                command,
                parameter,
            } => {
                let mut buf = Vec::with_capacity(15 + parameter.len());
                buf.push(FRAME_REMOTE_AT_COMMAND);
                buf.push(frame_id);
                buf.extend_from_slice(&destination.to_be_bytes());
                buf.extend_from_slice(&UNKNOWN_NETWORK_ADDRESS);
                buf.push(REMOTE_AT_APPLY);
                buf.extend_from_slice(command);
                buf.extend_from_slice(parameter);
                buf
            }
            Self::Transmit { destination, data } => {
                let mut buf = Vec::with_capacity(14 + data.len());
                buf.push(FRAME_TRANSMIT_REQUEST);
                buf.push(frame_id);
                buf.extend_from_slice(&destination.to_be_bytes());
                buf.extend_from_slice(&UNKNOWN_NETWORK_ADDRESS);
                buf.push(0x00); // broadcast radius: network maximum
                buf.push(0x00); // options
                buf.extend_from_slice(data);
                buf
            }
        }
    }
}

/// AT command driving digital pin `n` (D0..D9, then P0..P2 for 10..12).
pub fn digital_pin_command(channel: u8) -> Option<String> {
    match channel {
        0..=9 => Some(format!("D{}", channel)),
        10..=12 => Some(format!("P{}", channel - 10)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).expect("hex")
    }

    fn text_frame(payload: &str) -> Vec<u8> {
        let mut bytes = frame("900013a20040401122012340");
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    #[test]
    fn test_receive_packet_without_label() {
        let readings = decode(&text_frame("AABBCCDD\n"), &DecoderConfig::default()).expect("decode");
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].address.to_string(), "0013a20040401122");
        assert_eq!(readings[0].port, "serial");
        assert_eq!(readings[0].value, Value::from("AABBCCDD"));
    }

    #[test]
    fn test_receive_packet_with_label() {
        let readings = decode(&text_frame("status:1\n"), &DecoderConfig::default()).expect("decode");
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].address.to_string(), "0013a20040401122");
        assert_eq!(readings[0].port, "status");
        assert_eq!(readings[0].value, Value::from("1"));
    }

    #[test]
    fn test_receive_packet_splits_on_first_colon_only() {
        let readings = decode(&text_frame("time:12:30\r\n"), &DecoderConfig::default()).expect("decode");
        assert_eq!(readings[0].port, "time");
        assert_eq!(readings[0].value, Value::from("12:30"));
    }

    #[test]
    fn test_receive_packet_custom_default_port() {
        let config = DecoderConfig {
            default_port: "raw".into(),
            ..Default::default()
        };
        let readings = decode(&text_frame("  hello \r\n"), &config).expect("decode");
        assert_eq!(readings[0].port, "raw");
        assert_eq!(readings[0].value, Value::from("hello"));

        let readings = decode(&text_frame(":7\n"), &config).expect("decode");
        assert_eq!(readings[0].port, "raw");
        assert_eq!(readings[0].value, Value::from("7"));
    }

    #[test]
    fn test_receive_packet_label_must_be_topic_level() {
        for payload in ["a/b:1\n", "temp+:1\n", "#:1\n"] {
            let readings = decode(&text_frame(payload), &DecoderConfig::default()).expect("decode");
            assert_eq!(readings.len(), 1);
            assert_eq!(readings[0].port, "serial", "payload {:?}", payload);
            assert_eq!(readings[0].value, Value::from(payload.trim()));
        }
    }

    #[test]
    fn test_receive_packet_truncated_after_header() {
        let readings = decode(&frame("900013a20040401122"), &DecoderConfig::default()).expect("decode");
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, Value::from(""));
    }

    #[test]
    fn test_explicit_receive_payload_offset() {
        let mut bytes = frame("910013a20040401122fffee8e80011c10501");
        bytes.extend_from_slice(b"temp:21.5\n");
        let readings = decode(&bytes, &DecoderConfig::default()).expect("decode");
        assert_eq!(readings[0].port, "temp");
        assert_eq!(readings[0].value, Value::from("21.5"));
    }

    #[test]
    fn test_io_sample_digital_then_analog() {
        let bytes = frame("920013a200406bfd090123010110008010000B00");
        let readings = decode(&bytes, &DecoderConfig::default()).expect("decode");

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].address.to_string(), "0013a200406bfd09");
        assert_eq!(readings[0].port, "dio-12");
        assert_eq!(readings[0].value, Value::Int(1));
        assert_eq!(readings[1].address.to_string(), "0013a200406bfd09");
        assert_eq!(readings[1].port, "adc-7");
        assert_eq!(readings[1].value, Value::Int(2816));
    }

    #[test]
    fn test_io_sample_multiple_channels_ascending() {
        // DIO0, DIO3 set (sample: DIO3 high, DIO0 low); ADC1, ADC2.
        let bytes = frame("920013a200406bfd09fffe01010009060008012303ff");
        let readings = decode(&bytes, &DecoderConfig::default()).expect("decode");
        let ports: Vec<_> = readings.iter().map(|r| r.port.as_str()).collect();
        assert_eq!(ports, ["dio-0", "dio-3", "adc-1", "adc-2"]);
        assert_eq!(readings[0].value, Value::Int(0));
        assert_eq!(readings[1].value, Value::Int(1));
        assert_eq!(readings[2].value, Value::Int(0x0123));
        assert_eq!(readings[3].value, Value::Int(0x03ff));
    }

    #[test]
    fn test_io_sample_analog_only_has_no_digital_word() {
        let bytes = frame("920013a200406bfd09fffe010100000102aa");
        let readings = decode(&bytes, &DecoderConfig::default()).expect("decode");
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].port, "adc-0");
        assert_eq!(readings[0].value, Value::Int(0x02aa));
    }

    #[test]
    fn test_io_sample_adc_width_mask() {
        let bytes = frame("920013a200406bfd0901230101000001ffff");
        let config = DecoderConfig {
            adc_bits: 10,
            ..Default::default()
        };
        let readings = decode(&bytes, &config).expect("decode");
        assert_eq!(readings[0].value, Value::Int(0x03ff));
    }

    #[test]
    fn test_io_sample_truncated_degrades() {
        // Two analog channels announced, only one sample present.
        let bytes = frame("920013a200406bfd09012301010000030100");
        let readings = decode(&bytes, &DecoderConfig::default()).expect("decode");
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].port, "adc-0");

        let bytes = frame("920013a200406bfd0901230101");
        assert!(decode(&bytes, &DecoderConfig::default()).expect("decode").is_empty());
    }

    #[test]
    fn test_malformed_header() {
        let err = decode(&frame("900013a200"), &DecoderConfig::default()).unwrap_err();
        assert_eq!(err, DecodeError::Malformed { len: 5, needed: 9 });
        assert!(decode(&[], &DecoderConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_frame_type_is_empty() {
        let bytes = frame("8b0013a20040401122000000");
        assert!(decode(&bytes, &DecoderConfig::default()).expect("decode").is_empty());
        assert_eq!(FrameKind::from_u8(0x8b), None);
        assert_eq!(FrameKind::from_u8(0x92), Some(FrameKind::IoSample));
    }

    #[test]
    fn test_remote_at_is_response_yields_sample() {
        // 0x97, frame id 1, addr64, addr16, "IS", status OK, then the sample block.
        let bytes = frame("97010013a200406bfd09fffe495300010010000010");
        let readings = decode(&bytes, &DecoderConfig::default()).expect("decode");
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].address.to_string(), "0013a200406bfd09");
        assert_eq!(readings[0].port, "dio-4");
        assert_eq!(readings[0].value, Value::Int(1));
    }

    #[test]
    fn test_remote_at_other_responses_are_empty() {
        // "D4" acknowledgement.
        let ack = frame("97010013a200406bfd09fffe443400");
        assert!(decode(&ack, &DecoderConfig::default()).expect("decode").is_empty());

        // Failed "IS" (status 0x04: transmission failure).
        let failed = frame("97010013a200406bfd09fffe495304");
        assert!(decode(&failed, &DecoderConfig::default()).expect("decode").is_empty());

        // Too short for its address.
        let short = frame("97010013a200406bfd");
        assert_eq!(
            decode(&short, &DecoderConfig::default()).unwrap_err(),
            DecodeError::Malformed { len: 9, needed: 10 }
        );
    }

    #[test]
    fn test_remote_at_status() {
        let failed = frame("97070013a200406bfd09fffe443404");
        let status = remote_at_status(&failed).expect("status");
        assert_eq!(status.address.to_string(), "0013a200406bfd09");
        assert_eq!(status.frame_id, 7);
        assert_eq!(status.command_str(), "D4");
        assert!(!status.is_ok());

        assert!(remote_at_status(&frame("97070013a200406bfd09fffe4434")).is_none());
        assert!(remote_at_status(&text_frame("x")).is_none());
    }

    #[test]
    fn test_encode_remote_at() {
        let dest: Address = "0013a200406bfd09".parse().expect("addr");
        let body = OutboundFrame::remote_at(dest, "D4", vec![0x05]).encode(0x01);
        assert_eq!(hex::encode(body), "17010013a200406bfd09fffe02443405");
    }

    #[test]
    fn test_encode_transmit_request() {
        let dest: Address = "0013a20040401122".parse().expect("addr");
        let frame = OutboundFrame::Transmit {
            destination: dest,
            data: b"led:1\n".to_vec(),
        };
        assert_eq!(frame.destination(), dest);
        assert_eq!(
            hex::encode(frame.encode(0)),
            "10000013a20040401122fffe00006c65643a310a"
        );
    }

    #[test]
    fn test_io_channel_and_pin_commands() {
        assert_eq!(io_channel("dio-12", DIGITAL_PREFIX), Some(12));
        assert_eq!(io_channel("adc-7", ANALOG_PREFIX), Some(7));
        assert_eq!(io_channel("dio-x", DIGITAL_PREFIX), None);
        assert_eq!(io_channel("status", DIGITAL_PREFIX), None);
        assert_eq!(digital_pin_command(4).as_deref(), Some("D4"));
        assert_eq!(digital_pin_command(12).as_deref(), Some("P2"));
        assert_eq!(digital_pin_command(13), None);
    }
}
