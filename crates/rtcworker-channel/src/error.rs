/// Errors raised while decoding an inbound message.
///
/// A protocol error only ever concerns one message; the channel stays usable.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload is not a JSON object of the expected shape.
    #[error("invalid message payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A field required by the message shape is absent.
    #[error("message is missing '{0}'")]
    MissingField(&'static str),

    /// The message carries both discriminants.
    #[error("message has both 'method' and 'event' fields")]
    Ambiguous,

    /// The message carries neither discriminant.
    #[error("missing 'method' and 'event' fields")]
    MissingDiscriminant,
}

/// Errors that can occur on the host channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Adopting the endpoints failed.
    #[error("transport error: {0}")]
    Transport(#[from] rtcworker_transport::TransportError),

    /// The byte stream is malformed or the underlying I/O failed.
    #[error("frame error: {0}")]
    Frame(#[from] rtcworker_frame::FrameError),

    /// A single inbound message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The host closed its end of the stream.
    #[error("host disconnected")]
    Disconnected,

    /// The channel was closed locally.
    #[error("channel closed")]
    Closed,

    /// An outbound message could not be serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An outbound message exceeds the frame limit. Nothing was written.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ChannelError {
    /// Whether the error ends the channel.
    ///
    /// Protocol, serialization and size errors affect one message only.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ChannelError::Protocol(_) | ChannelError::Json(_) | ChannelError::MessageTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_not_fatal() {
        assert!(!ChannelError::Protocol(ProtocolError::MissingDiscriminant).is_fatal());
        assert!(ChannelError::Disconnected.is_fatal());
        assert!(ChannelError::Closed.is_fatal());
        assert!(ChannelError::Frame(rtcworker_frame::FrameError::InvalidLength).is_fatal());
        assert!(!ChannelError::MessageTooLarge { size: 10, max: 5 }.is_fatal());
    }

    #[test]
    fn missing_discriminant_message_matches_host_wording() {
        assert_eq!(
            ProtocolError::MissingDiscriminant.to_string(),
            "missing 'method' and 'event' fields"
        );
    }
}
