//! Multiplexed request dispatch for a media worker process.
//!
//! The host talks to the worker over pre-opened descriptors using netstring
//! frames carrying JSON requests, responses and notifications. The worker
//! routes each message to a player (a media source) or a handler (one engine
//! connection with its data channels) and streams engine events back.
//!
//! # Crate Structure
//!
//! - [`transport`]: descriptor endpoints
//! - [`frame`]: netstring framing
//! - [`channel`]: message model and the framed host channel
//! - [`worker`]: the dispatcher state machine
//! - [`engine`]: media engine capability traits and the loopback engine

/// Re-export transport types.
pub mod transport {
    pub use rtcworker_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rtcworker_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use rtcworker_channel::*;
}

pub mod command;
pub mod engine;
pub mod error;
pub mod handler;
pub mod player;
pub mod registry;
pub mod settings;
pub mod worker;

pub use error::{RegistryError, Result, WorkerError};
pub use registry::Registry;
pub use settings::WorkerSettings;
pub use worker::{Worker, WorkerState};
