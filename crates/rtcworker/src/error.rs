use rtcworker_channel::{ChannelError, ErrorKind};

use crate::engine::EngineError;

/// Errors raised by an entity registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An entity with this id is already registered.
    #[error("{namespace} with id \"{id}\" already exists")]
    AlreadyExists { namespace: &'static str, id: String },

    /// No entity with this id is registered.
    #[error("{namespace} with id \"{id}\" not found")]
    NotFound { namespace: &'static str, id: String },
}

/// Errors raised while serving a request or notification.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Missing or malformed arguments.
    #[error("{0}")]
    Validation(String),

    /// The method name is not known.
    #[error("unknown method \"{0}\"")]
    UnknownMethod(String),

    /// The event name is not known.
    #[error("unknown event \"{0}\"")]
    UnknownEvent(String),

    /// The addressed entity does not exist.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The media engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The operation failed for any other reason.
    #[error("{0}")]
    Failed(String),

    /// The host channel failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl WorkerError {
    pub fn validation(reason: impl Into<String>) -> Self {
        WorkerError::Validation(reason.into())
    }

    /// Error tag reported in a rejected response.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Validation(_)
            | WorkerError::UnknownMethod(_)
            | WorkerError::UnknownEvent(_) => ErrorKind::Validation,
            _ => ErrorKind::Generic,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
