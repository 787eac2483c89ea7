/// Errors that can occur while adopting host channel endpoints.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The descriptor is not open in this process.
    #[error("descriptor {fd} is not open: {source}")]
    InvalidDescriptor { fd: i32, source: std::io::Error },

    /// The descriptor is open but is not a stream socket.
    #[error("descriptor {fd} is not a stream socket")]
    NotASocket { fd: i32 },

    /// An I/O error occurred while adopting the endpoints.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
