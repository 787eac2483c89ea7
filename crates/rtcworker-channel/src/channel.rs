use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rtcworker_frame::{FrameConfig, FrameError, NetstringCodec};
use rtcworker_transport::{BoxedReader, BoxedWriter, Endpoints};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::error::{ChannelError, Result};
use crate::message::{Id, Message, Notification};

/// Framed, JSON-encoded connection to the host.
///
/// The endpoints are adopted on first use. Every outbound message is written
/// as one complete frame while holding the writer lock, so concurrent senders
/// (the dispatcher and any number of background notifiers) never interleave
/// bytes on the wire.
pub struct Channel {
    endpoints: StdMutex<Option<Endpoints>>,
    config: FrameConfig,
    connection: OnceCell<Connection>,
    closed: AtomicBool,
}

/// Both halves are taken out on close so the endpoints are released.
struct Connection {
    reader: Mutex<Option<FramedRead<BoxedReader, NetstringCodec>>>,
    writer: Mutex<Option<FramedWrite<BoxedWriter, NetstringCodec>>>,
}

impl Channel {
    /// Create a channel over `endpoints` with the default frame configuration.
    pub fn new(endpoints: Endpoints) -> Self {
        Self::with_config(endpoints, FrameConfig::default())
    }

    /// Create a channel with an explicit frame configuration.
    pub fn with_config(endpoints: Endpoints, config: FrameConfig) -> Self {
        Self {
            endpoints: StdMutex::new(Some(endpoints)),
            config,
            connection: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Adopt the endpoints. Runs at most once; later calls reuse the connection.
    pub async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    /// Whether the endpoints have been adopted.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// Whether [`Channel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the next inbound message.
    ///
    /// A clean or mid-frame end of stream is reported as
    /// [`ChannelError::Disconnected`]. Malformed frames are fatal;
    /// undecodable payloads are reported as non-fatal protocol errors.
    pub async fn receive(&self) -> Result<Message> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let connection = self.connection().await?;
        let mut guard = connection.reader.lock().await;
        let reader = guard.as_mut().ok_or(ChannelError::Closed)?;

        let next = reader.next().await;
        if self.is_closed() {
            // Closed while waiting; the reader is released here instead.
            guard.take();
            return Err(ChannelError::Closed);
        }
        match next {
            None | Some(Err(FrameError::ConnectionClosed)) => Err(ChannelError::Disconnected),
            Some(Err(err)) => Err(ChannelError::Frame(err)),
            Some(Ok(payload)) => {
                trace!(len = payload.len(), "frame received");
                Ok(Message::decode(&payload)?)
            }
        }
    }

    /// Encode and write one message as a single frame.
    ///
    /// A message over the frame limit fails with
    /// [`ChannelError::MessageTooLarge`] before anything is written.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let payload = Bytes::from(message.encode()?);
        if payload.len() > self.config.max_payload_size {
            return Err(ChannelError::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        let connection = self.connection().await?;

        let mut guard = connection.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        trace!(len = payload.len(), "frame sent");
        writer.send(payload).await?;
        Ok(())
    }

    /// Send a worker-originated notification about `target_id`.
    pub async fn notify(
        &self,
        target_id: impl Into<Id>,
        event: &str,
        data: Option<Value>,
    ) -> Result<()> {
        let notification = Notification::targeted(target_id, event, data);
        self.send(&Message::Notification(notification)).await
    }

    /// Flush and release both endpoints. Idempotent.
    ///
    /// Waits for an in-flight frame to finish before shutting the writer down.
    /// A receive in progress keeps the reader until it returns.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.take();
        }

        if let Some(connection) = self.connection.get() {
            if let Ok(mut reader) = connection.reader.try_lock() {
                reader.take();
            }
            let writer = connection.writer.lock().await.take();
            if let Some(mut writer) = writer {
                SinkExt::<Bytes>::close(&mut writer).await?;
            }
        }
        debug!("channel closed");
        Ok(())
    }

    /// Whether the inbound endpoint is still held.
    pub async fn has_reader(&self) -> bool {
        match self.connection.get() {
            Some(connection) => connection.reader.lock().await.is_some(),
            None => self.endpoints.lock().map(|e| e.is_some()).unwrap_or(false),
        }
    }

    async fn connection(&self) -> Result<&Connection> {
        self.connection
            .get_or_try_init(|| async {
                let endpoints = self
                    .endpoints
                    .lock()
                    .map_err(|_| ChannelError::Closed)?
                    .take()
                    .ok_or(ChannelError::Closed)?;
                debug!(endpoints = ?endpoints, "connecting channel");

                let (reader, writer) = endpoints.into_async()?;
                let codec = NetstringCodec::with_config(self.config.clone());
                Ok::<_, ChannelError>(Connection {
                    reader: Mutex::new(Some(FramedRead::new(reader, codec.clone()))),
                    writer: Mutex::new(Some(FramedWrite::new(writer, codec))),
                })
            })
            .await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}
