//! Netstring message framing for the host channel.
//!
//! Every message travels as one netstring:
//! - the payload length as ASCII decimal digits
//! - a `:` delimiter
//! - the payload bytes
//! - a trailing `,` delimiter
//!
//! The transport may deliver arbitrary chunk sizes; [`Framer`] and the async
//! [`NetstringCodec`] buffer partial frames so callers only ever see whole ones.

pub mod codec;
pub mod error;
pub mod framer;

#[cfg(feature = "async")]
pub mod async_codec;

#[cfg(feature = "async")]
pub use async_codec::NetstringCodec;
pub use codec::{decode_frame, encode, encode_frame, encoded_len, FrameConfig, DEFAULT_MAX_PAYLOAD};
pub use error::{FrameError, Result};
pub use framer::Framer;
