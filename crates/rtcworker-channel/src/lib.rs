//! Message model and framed host channel.
//!
//! [`Message`] is the JSON shape carried by each frame: a request, a response,
//! or a notification. [`Channel`] binds the frame codec to the host endpoints
//! and is safe to share between the dispatcher and background tasks.

pub mod channel;
pub mod error;
pub mod message;

pub use channel::Channel;
pub use error::{ChannelError, ProtocolError, Result};
pub use message::{ErrorKind, Id, Internal, Message, Notification, Request, Response};
