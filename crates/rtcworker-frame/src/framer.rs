use bytes::{Bytes, BytesMut};

use crate::codec::{decode_frame, encode, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Incremental frame extractor.
///
/// Feed it whatever chunks the transport delivers; it hands back every frame
/// completed so far and keeps the remainder for the next call. Fragmentation
/// never changes the sequence of frames produced.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    config: FrameConfig,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Create a new framer with default configuration.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a new framer with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Append `bytes` and return every frame completed so far, in wire order.
    ///
    /// A framing error leaves the stream unrecoverable: the framer cannot find
    /// the next frame boundary once a length prefix or terminator is wrong.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Pop the next complete frame out of the buffered bytes, if any.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        decode_frame(&mut self.buf, self.config.max_payload_size)
    }

    /// Signal end of stream.
    ///
    /// Fails with [`FrameError::ConnectionClosed`] when a partial frame is still buffered.
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::ConnectionClosed)
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Frame a payload for output. Pure; does not touch the inbound buffer.
    pub fn encode(payload: &[u8]) -> Bytes {
        encode(payload)
    }

    /// Current framer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
