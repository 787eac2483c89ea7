use std::fmt;

use rtcworker::channel::ChannelError;
use rtcworker::frame::FrameError;
use rtcworker::settings::SettingsError;
use rtcworker::transport::TransportError;
use rtcworker::WorkerError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
/// The host reads this as "the worker was launched with wrong settings".
pub const INVALID_SETTINGS: i32 = 42;
#[allow(dead_code)]
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn settings_error(context: &str, err: SettingsError) -> CliError {
    CliError::new(INVALID_SETTINGS, format!("{context}: {err}"))
}

pub fn io_error(context: &str, err: std::io::Error) -> CliError {
    CliError::new(INTERNAL, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn worker_error(context: &str, err: WorkerError) -> CliError {
    match err {
        WorkerError::Channel(ChannelError::Transport(err)) => transport_error(context, err),
        WorkerError::Channel(ChannelError::Frame(err)) => frame_error(context, err),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}
