use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Separates the length prefix from the payload.
pub const LENGTH_DELIMITER: u8 = b':';

/// Follows every payload.
pub const TERMINATOR: u8 = b',';

/// Default maximum payload size: 4 MiB (the host's netstring payload limit).
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 4 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Number of bytes `payload_len` occupies once framed.
pub fn encoded_len(payload_len: usize) -> usize {
    decimal_digits(payload_len) + 1 + payload_len + 1
}

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬─────┬───────────────────┬─────┐
/// │ Length (ASCII    │ ':' │ Payload           │ ',' │
/// │ decimal, no pad) │     │ (Length bytes)    │     │
/// └──────────────────┴─────┴───────────────────┴─────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(encoded_len(payload.len()));
    dst.put_slice(payload.len().to_string().as_bytes());
    dst.put_u8(LENGTH_DELIMITER);
    dst.put_slice(payload);
    dst.put_u8(TERMINATOR);
}

/// Encode a payload into a standalone frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(encoded_len(payload.len()));
    encode_frame(payload, &mut dst);
    dst.freeze()
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer and returns the payload.
/// Oversized and malformed length prefixes are rejected as soon as they are seen,
/// without waiting for the rest of the frame.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    let mut length = 0usize;
    let mut delimiter_at = None;

    for (index, &byte) in src.iter().enumerate() {
        match byte {
            b'0'..=b'9' => {
                // "0" is the only length allowed to start with a zero.
                if index == 1 && src[0] == b'0' {
                    return Err(FrameError::InvalidLength);
                }
                length = length
                    .saturating_mul(10)
                    .saturating_add(usize::from(byte - b'0'));
                if length > max_payload {
                    return Err(FrameError::PayloadTooLarge {
                        size: length,
                        max: max_payload,
                    });
                }
            }
            LENGTH_DELIMITER if index > 0 => {
                delimiter_at = Some(index);
                break;
            }
            _ => return Err(FrameError::InvalidLength),
        }
    }

    let Some(delimiter_at) = delimiter_at else {
        return Ok(None); // Need more data
    };

    let total = delimiter_at + 1 + length + 1;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let found = src[total - 1];
    if found != TERMINATOR {
        return Err(FrameError::MissingTerminator { found });
    }

    src.advance(delimiter_at + 1);
    let payload = src.split_to(length).freeze();
    src.advance(1);

    Ok(Some(payload))
}

fn decimal_digits(mut value: usize) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}
