use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, FrameConfig};
use crate::error::FrameError;

/// Netstring codec for `tokio_util::codec::{FramedRead, FramedWrite}`.
///
/// Decoding yields whole payloads. A stream that ends inside a frame fails with
/// [`FrameError::ConnectionClosed`]; a stream that ends on a frame boundary simply ends.
#[derive(Debug, Clone, Default)]
pub struct NetstringCodec {
    config: FrameConfig,
}

impl NetstringCodec {
    /// Create a new codec with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new codec with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.config.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&[u8]>::encode(self, item.as_ref(), dst)
    }
}

impl Encoder<&[u8]> for NetstringCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(item, dst);
        Ok(())
    }
}
