//! Endpoints for the host channel.
//!
//! The host hands the worker its channel as pre-opened descriptors before the
//! process starts:
//! - one shared duplex descriptor, or
//! - a read descriptor and a write descriptor.
//!
//! This is the lowest layer of rtcworker. The worker never opens these
//! descriptors itself; it only adopts them through [`Endpoints`].

pub mod endpoints;
pub mod error;

#[cfg(feature = "async")]
pub use endpoints::{BoxedReader, BoxedWriter};
pub use endpoints::Endpoints;
pub use error::{Result, TransportError};

/// Descriptor the host uses for the channel when nothing else is configured.
pub const DEFAULT_CHANNEL_FD: i32 = 3;
