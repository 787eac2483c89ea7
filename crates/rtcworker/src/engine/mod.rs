//! Capability surface of the media engine.
//!
//! The worker never negotiates media itself. It drives connections, transceivers
//! and data channels through these traits and forwards whatever the engine
//! reports through subscriptions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod loopback;

pub use loopback::LoopbackEngine;

/// Errors reported by the media engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation is not valid in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An argument was rejected by the engine.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The media source could not be opened.
    #[error("media source error: {0}")]
    Source(String),

    /// The object was already closed.
    #[error("{0} is closed")]
    Closed(&'static str),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Subscription callback. Invoked synchronously by the engine; must not block.
pub type EventCallback<E> = Arc<dyn Fn(E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sendrecv,
    Sendonly,
    Recvonly,
    Inactive,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Live,
    Ended,
}

/// One ICE server entry of a connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// `urls` may be a single URL or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn is_empty(&self) -> bool {
        match self {
            IceUrls::One(url) => url.is_empty(),
            IceUrls::Many(urls) => urls.is_empty() || urls.iter().any(String::is_empty),
        }
    }
}

/// Connection configuration, as supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl RtcConfiguration {
    /// Check that every ICE server names at least one URL.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (index, server) in self.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                return Err(format!("missing 'urls' in iceServers[{index}]"));
            }
        }
        Ok(())
    }
}

/// Options for a negotiated data channel. Unset fields take engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelInit {
    #[serde(default)]
    pub id: Option<u16>,
    #[serde(default)]
    pub ordered: Option<bool>,
    #[serde(default)]
    pub max_packet_life_time: Option<u32>,
    #[serde(default)]
    pub max_retransmits: Option<u32>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Negotiated parameters of a data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelParameters {
    pub stream_id: Option<u16>,
    pub ordered: bool,
    pub max_packet_life_time: Option<u32>,
    pub max_retransmits: Option<u32>,
    pub label: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Device,
    File,
    Url,
}

/// Where a player reads media from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// Device name, file path or URL.
    pub file: String,
    pub format: Option<String>,
    pub options: BTreeMap<String, Value>,
}

/// Tracks produced by an opened media source.
#[derive(Clone, Default)]
pub struct MediaSource {
    pub audio: Option<Arc<dyn MediaTrack>>,
    pub video: Option<Arc<dyn MediaTrack>>,
}

/// One entry of a statistics report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntry {
    pub id: String,
    pub kind: String,
    pub timestamp: f64,
    pub values: Map<String, Value>,
}

impl StatsEntry {
    /// Flatten into the JSON object reported to the host.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("timestamp".into(), Value::from(self.timestamp));
        object.insert("type".into(), Value::from(self.kind.clone()));
        object.insert("id".into(), Value::from(self.id.clone()));
        for (key, value) in &self.values {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

pub type StatsReport = Vec<StatsEntry>;

/// Events reported by a connection.
#[derive(Clone)]
pub enum ConnectionEvent {
    SignalingStateChange(SignalingState),
    IceGatheringStateChange(IceGatheringState),
    IceConnectionStateChange(IceConnectionState),
    /// A remote track became available.
    Track(Arc<dyn MediaTrack>),
}

/// Events reported by a data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DataChannelEvent {
    Open,
    Closing,
    Close,
    Message(String),
    Binary(Vec<u8>),
    BufferedAmountLow,
}

/// How a new transceiver is seeded.
#[derive(Clone)]
pub enum TransceiverInit {
    /// Send the given track.
    Track(Arc<dyn MediaTrack>),
    /// No track yet; just a media section of this kind.
    Kind(MediaKind, Direction),
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn ready_state(&self) -> TrackState;
    /// Stop producing media. Idempotent.
    fn stop(&self);
}

#[async_trait]
pub trait Transceiver: Send + Sync {
    fn mid(&self) -> Option<String>;
    fn kind(&self) -> MediaKind;
    fn stopped(&self) -> bool;
    fn direction(&self) -> Direction;
    fn set_direction(&self, direction: Direction) -> Result<()>;
    fn current_direction(&self) -> Option<Direction>;
    fn sender_track(&self) -> Option<Arc<dyn MediaTrack>>;
    fn receiver_track(&self) -> Option<Arc<dyn MediaTrack>>;
    fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<()>;
    async fn sender_stats(&self) -> Result<StatsReport>;
    async fn receiver_stats(&self) -> Result<StatsReport>;
}

pub trait DataChannel: Send + Sync {
    fn parameters(&self) -> DataChannelParameters;
    fn ready_state(&self) -> DataChannelState;
    fn buffered_amount(&self) -> usize;
    fn buffered_amount_low_threshold(&self) -> usize;
    fn set_buffered_amount_low_threshold(&self, threshold: usize);
    fn send_text(&self, text: &str) -> Result<()>;
    fn send_binary(&self, bytes: &[u8]) -> Result<()>;
    /// Begin closing. Idempotent.
    fn close(&self);
    fn subscribe(&self, callback: EventCallback<DataChannelEvent>);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn ice_gathering_state(&self) -> IceGatheringState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn local_description(&self) -> Option<SessionDescription>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    fn add_transceiver(&self, init: TransceiverInit) -> Result<Arc<dyn Transceiver>>;
    fn transceivers(&self) -> Vec<Arc<dyn Transceiver>>;
    async fn stats(&self) -> Result<StatsReport>;
    fn create_data_channel(&self, init: DataChannelInit) -> Result<Arc<dyn DataChannel>>;
    fn subscribe(&self, callback: EventCallback<ConnectionEvent>);
    /// Close the connection and everything it owns. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_connection(
        &self,
        configuration: Option<RtcConfiguration>,
    ) -> Result<Arc<dyn PeerConnection>>;

    async fn open_source(&self, source: &SourceDescriptor) -> Result<MediaSource>;
}
