/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length prefix is empty, has a leading zero, or contains a non-digit.
    #[error("invalid netstring length prefix")]
    InvalidLength,

    /// The byte after the declared payload is not the `,` terminator.
    #[error("netstring terminator missing (found byte 0x{found:02x})")]
    MissingTerminator { found: u8 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the byte stream itself is malformed (as opposed to I/O failure or EOF).
    ///
    /// A malformed stream cannot be resynchronised; the connection must be dropped.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidLength
                | FrameError::MissingTerminator { .. }
                | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
