// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// API-mode byte stream framing.
//
// 0x7E | length (u16 BE) | body | checksum
//
// checksum = 0xFF - (sum(body) & 0xFF). In escaped mode (AP=2) every byte
// after the start delimiter that is 0x7E, 0x7D, 0x11 or 0x13 is sent as
// 0x7D followed by the byte XOR 0x20.

use thiserror::Error;

pub const START_DELIMITER: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
const ESCAPE_XOR: u8 = 0x20;

/// Largest body accepted by the deframer. Radio frames are far smaller;
/// anything above is line noise that happened to look like a length.
pub const MAX_BODY_SIZE: usize = 1024;

/// Errors detected while de-framing the serial stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("frame length {0} exceeds maximum")]
    Oversize(usize),
}

fn needs_escape(b: u8) -> bool {
    matches!(b, START_DELIMITER | ESCAPE | XON | XOFF)
}

/// Checksum over a frame body.
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0xFF - sum
}

/// Wrap a frame body for transmission.
pub fn encode(body: &[u8], escaped: bool) -> Result<Vec<u8>, FramingError> {
    let len = u16::try_from(body.len())
        .ok()
        .filter(|&len| usize::from(len) <= MAX_BODY_SIZE)
        .ok_or(FramingError::Oversize(body.len()))?;
    let mut raw = Vec::with_capacity(body.len() + 3);
    raw.extend_from_slice(&len.to_be_bytes());
    raw.extend_from_slice(body);
    raw.push(checksum(body));

    let mut out = Vec::with_capacity(raw.len() * 2 + 1);
    out.push(START_DELIMITER);
    for b in raw {
        if escaped && needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a start delimiter.
    Hunt,
    LengthHigh,
    LengthLow(u8),
    Body,
    Checksum,
}

/// Incremental de-framer for the serial byte stream.
///
/// Feed arbitrary chunks; complete frame bodies come out in order. A start
/// delimiter always restarts framing, so the stream resynchronizes after
/// garbage or a lost byte.
#[derive(Debug)]
pub struct Deframer {
    escaped: bool,
    state: State,
    escape_next: bool,
    expected_len: usize,
    body: Vec<u8>,
}

impl Deframer {
    pub fn new(escaped: bool) -> Self {
        Self {
            escaped,
            state: State::Hunt,
            escape_next: false,
            expected_len: 0,
            body: Vec::new(),
        }
    }

    /// Push received bytes; returns every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, FramingError>> {
        let mut out = Vec::new();

        for &raw in bytes {
            if raw == START_DELIMITER {
                // In escaped mode a bare 0x7E can only be a delimiter. In
                // transparent mode it may be data, so only restart when
                // hunting.
                if self.escaped || self.state == State::Hunt {
                    self.restart();
                    self.state = State::LengthHigh;
                    continue;
                }
            }

            let b = if self.escaped {
                if self.escape_next {
                    self.escape_next = false;
                    raw ^ ESCAPE_XOR
                } else if raw == ESCAPE {
                    self.escape_next = true;
                    continue;
                } else {
                    raw
                }
            } else {
                raw
            };

            match self.state {
                State::Hunt => {}
                State::LengthHigh => self.state = State::LengthLow(b),
                State::LengthLow(high) => {
                    let len = usize::from(u16::from_be_bytes([high, b]));
                    if len > MAX_BODY_SIZE {
                        out.push(Err(FramingError::Oversize(len)));
                        self.restart();
                    } else {
                        self.expected_len = len;
                        self.state = if len == 0 { State::Checksum } else { State::Body };
                    }
                }
                State::Body => {
                    self.body.push(b);
                    if self.body.len() == self.expected_len {
                        self.state = State::Checksum;
                    }
                }
                State::Checksum => {
                    let expected = checksum(&self.body);
                    if b == expected {
                        out.push(Ok(std::mem::take(&mut self.body)));
                    } else {
                        out.push(Err(FramingError::Checksum {
                            expected,
                            actual: b,
                        }));
                    }
                    self.restart();
                }
            }
        }

        out
    }

    fn restart(&mut self) {
        self.state = State::Hunt;
        self.escape_next = false;
        self.expected_len = 0;
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).expect("hex")
    }

    #[test]
    fn test_checksum_known_frame() {
        // AT command "NJ" from the radio documentation.
        assert_eq!(checksum(&bytes("08014e4a")), 0x5e);
    }

    #[test]
    fn test_encode_transparent() {
        let wire = encode(&bytes("08014e4a"), false).expect("encode");
        assert_eq!(hex::encode(wire), "7e000408014e4a5e");
    }

    #[test]
    fn test_encode_escapes_reserved_bytes() {
        // Body containing 0x7E and 0x11.
        let body = bytes("107e11");
        let wire = encode(&body, true).expect("encode");
        assert_eq!(wire[0], START_DELIMITER);
        assert!(!wire[1..].contains(&START_DELIMITER));
        assert!(!wire[1..].contains(&XON));

        let mut deframer = Deframer::new(true);
        let frames = deframer.push(&wire);
        assert_eq!(frames, vec![Ok(body)]);
    }

    #[test]
    fn test_deframer_split_chunks() {
        let body = bytes("920013a200406bfd090123010110008010000B00");
        let wire = encode(&body, false).expect("encode");
        let mut deframer = Deframer::new(false);

        let (a, b) = wire.split_at(7);
        assert!(deframer.push(a).is_empty());
        assert_eq!(deframer.push(b), vec![Ok(body)]);
    }

    #[test]
    fn test_deframer_multiple_frames_and_garbage() {
        let first = bytes("900013a20040401122012340");
        let second = bytes("920013a200406bfd090123010110008010000B00");
        let mut stream = vec![0x00, 0xAA, 0x13];
        stream.extend(encode(&first, false).expect("encode"));
        stream.extend([0x55]);
        stream.extend(encode(&second, false).expect("encode"));

        let frames = Deframer::new(false).push(&stream);
        assert_eq!(frames, vec![Ok(first), Ok(second)]);
    }

    #[test]
    fn test_deframer_checksum_mismatch_then_recovers() {
        let body = bytes("08014e4a");
        let mut wire = encode(&body, false).expect("encode");
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        wire.extend(encode(&body, false).expect("encode"));

        let frames = Deframer::new(false).push(&wire);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FramingError::Checksum { .. })));
        assert_eq!(frames[1], Ok(body));
    }

    #[test]
    fn test_encode_rejects_oversize_body() {
        assert_eq!(
            encode(&[0u8; MAX_BODY_SIZE + 1], false),
            Err(FramingError::Oversize(MAX_BODY_SIZE + 1))
        );
        assert_eq!(
            encode(&[0u8; 70_000], true),
            Err(FramingError::Oversize(70_000))
        );
        assert!(encode(&[0u8; MAX_BODY_SIZE], false).is_ok());
    }

    #[test]
    fn test_deframer_oversize_length() {
        let frames = Deframer::new(false).push(&[START_DELIMITER, 0xFF, 0xFF, 0x00]);
        assert_eq!(frames, vec![Err(FramingError::Oversize(0xFFFF))]);
    }

    #[test]
    fn test_escaped_delimiter_resynchronizes() {
        let body = bytes("08014e4a");
        // Truncated frame followed by a complete one.
        let mut stream = vec![START_DELIMITER, 0x00, 0x04, 0x08];
        stream.extend(encode(&body, true).expect("encode"));

        let frames = Deframer::new(true).push(&stream);
        assert_eq!(frames, vec![Ok(body)]);
    }
}
