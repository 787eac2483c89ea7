//! Deterministic in-process media engine.
//!
//! Nothing leaves the process. Descriptions are synthetic SDP, mids are
//! assigned in transceiver order, ICE connects as soon as an offer/answer
//! exchange completes and data channels open with it. Data channel sends are
//! buffered and echoed back as inbound messages. [`LoopbackEngine::new`]
//! flushes the buffer on its own right after each send; an engine built with
//! [`LoopbackEngine::manual`] holds it until
//! [`LoopbackEngine::drain_data_channels`] runs.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    ConnectionEvent, DataChannel, DataChannelEvent, DataChannelInit, DataChannelParameters,
    DataChannelState, Direction, EngineError, EventCallback, IceConnectionState,
    IceGatheringState, MediaEngine, MediaKind, MediaSource, MediaTrack, PeerConnection, Result,
    RtcConfiguration, SdpType, SessionDescription, SignalingState, SourceDescriptor, StatsEntry,
    StatsReport, TrackState, Transceiver, TransceiverInit,
};

const TRANSPORT_STATS_ID: &str = "transport-0";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Sendrecv => "sendrecv",
        Direction::Sendonly => "sendonly",
        Direction::Recvonly => "recvonly",
        Direction::Inactive => "inactive",
        Direction::Stopped => "inactive",
    }
}

struct Subscribers<E> {
    callbacks: Mutex<Vec<EventCallback<E>>>,
}

impl<E: Clone> Subscribers<E> {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, callback: EventCallback<E>) {
        lock(&self.callbacks).push(callback);
    }

    // Callbacks run without the list locked so they may subscribe again.
    fn emit(&self, event: E) {
        let callbacks = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[derive(Default)]
struct Shared {
    auto_drain: bool,
    next_id: AtomicU64,
    connections_created: AtomicUsize,
    connection_close_calls: AtomicUsize,
    connections_closed: AtomicUsize,
    tracks_stopped: AtomicUsize,
    data_channels: Mutex<Vec<Weak<LoopbackDataChannel>>>,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// In-process [`MediaEngine`] with counters for tests.
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Engine that delivers data channel sends on its own.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                auto_drain: true,
                ..Shared::default()
            }),
        }
    }

    /// Engine whose data channel sends wait for [`Self::drain_data_channels`].
    pub fn manual() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn connections_created(&self) -> usize {
        self.shared.connections_created.load(Ordering::Acquire)
    }

    /// Number of `close()` calls, including repeated ones.
    pub fn connection_close_calls(&self) -> usize {
        self.shared.connection_close_calls.load(Ordering::Acquire)
    }

    pub fn connections_closed(&self) -> usize {
        self.shared.connections_closed.load(Ordering::Acquire)
    }

    pub fn tracks_stopped(&self) -> usize {
        self.shared.tracks_stopped.load(Ordering::Acquire)
    }

    /// Flush every data channel's send buffer, echoing each payload back.
    pub fn drain_data_channels(&self) {
        let channels: Vec<Arc<LoopbackDataChannel>> = {
            let mut registered = lock(&self.shared.data_channels);
            registered.retain(|channel| channel.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for channel in channels {
            channel.drain();
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_connection(
        &self,
        configuration: Option<RtcConfiguration>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if let Some(configuration) = &configuration {
            configuration
                .validate()
                .map_err(EngineError::InvalidParameter)?;
        }

        let id = self.shared.next_id();
        self.shared
            .connections_created
            .fetch_add(1, Ordering::AcqRel);
        debug!(connection = id, "loopback connection created");
        Ok(Arc::new(LoopbackConnection::new(id, self.shared.clone())))
    }

    async fn open_source(&self, source: &SourceDescriptor) -> Result<MediaSource> {
        if source.file.is_empty() {
            return Err(EngineError::Source("empty source location".into()));
        }

        let id = self.shared.next_id();
        let track = |kind: MediaKind| -> Arc<dyn MediaTrack> {
            Arc::new(LoopbackTrack::new(
                format!("player{id}-{}", kind_str(kind)),
                kind,
                self.shared.clone(),
            ))
        };
        Ok(MediaSource {
            audio: Some(track(MediaKind::Audio)),
            video: Some(track(MediaKind::Video)),
        })
    }
}

pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    ended: AtomicBool,
    shared: Arc<Shared>,
}

impl LoopbackTrack {
    fn new(id: String, kind: MediaKind, shared: Arc<Shared>) -> Self {
        Self {
            id,
            kind,
            ended: AtomicBool::new(false),
            shared,
        }
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::Acquire) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn stop(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            self.shared.tracks_stopped.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct TransceiverState {
    mid: Option<String>,
    direction: Direction,
    current_direction: Option<Direction>,
    stopped: bool,
    sender: Option<Arc<dyn MediaTrack>>,
    receiver: Option<Arc<dyn MediaTrack>>,
}

pub struct LoopbackTransceiver {
    kind: MediaKind,
    ssrc: u32,
    state: Mutex<TransceiverState>,
}

impl LoopbackTransceiver {
    fn new(kind: MediaKind, ssrc: u32, direction: Direction) -> Self {
        Self {
            kind,
            ssrc,
            state: Mutex::new(TransceiverState {
                mid: None,
                direction,
                current_direction: None,
                stopped: false,
                sender: None,
                receiver: None,
            }),
        }
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.direction = Direction::Stopped;
        state.current_direction = Some(Direction::Stopped);
    }

    fn stats_entry(&self, kind: &str, values: Value) -> StatsEntry {
        let values = match values {
            Value::Object(values) => values,
            _ => serde_json::Map::new(),
        };
        StatsEntry {
            id: format!("{kind}-{}", self.ssrc),
            kind: kind.to_string(),
            timestamp: now(),
            values,
        }
    }

    fn sender_entries(&self, track: &dyn MediaTrack) -> StatsReport {
        let kind = kind_str(self.kind);
        vec![
            self.stats_entry(
                "outbound-rtp",
                json!({
                    "ssrc": self.ssrc,
                    "kind": kind,
                    "transportId": TRANSPORT_STATS_ID,
                    "packetsSent": 0,
                    "bytesSent": 0,
                    "trackId": track.id(),
                }),
            ),
            self.stats_entry(
                "remote-inbound-rtp",
                json!({
                    "ssrc": self.ssrc,
                    "kind": kind,
                    "transportId": TRANSPORT_STATS_ID,
                    "packetsReceived": 0,
                    "packetsLost": 0,
                    "jitter": 0.0,
                    "roundTripTime": 0.0,
                    "fractionLost": 0.0,
                }),
            ),
        ]
    }

    fn receiver_entries(&self) -> StatsReport {
        let kind = kind_str(self.kind);
        vec![
            self.stats_entry(
                "inbound-rtp",
                json!({
                    "ssrc": self.ssrc,
                    "kind": kind,
                    "transportId": TRANSPORT_STATS_ID,
                    "packetsReceived": 0,
                    "packetsLost": 0,
                    "jitter": 0.0,
                }),
            ),
            self.stats_entry(
                "remote-outbound-rtp",
                json!({
                    "ssrc": self.ssrc,
                    "kind": kind,
                    "transportId": TRANSPORT_STATS_ID,
                    "packetsSent": 0,
                    "bytesSent": 0,
                    "remoteTimestamp": now(),
                }),
            ),
        ]
    }
}

#[async_trait]
impl Transceiver for LoopbackTransceiver {
    fn mid(&self) -> Option<String> {
        lock(&self.state).mid.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    fn direction(&self) -> Direction {
        lock(&self.state).direction
    }

    fn set_direction(&self, direction: Direction) -> Result<()> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Err(EngineError::InvalidState("transceiver is stopped".into()));
        }
        if direction == Direction::Stopped {
            return Err(EngineError::InvalidParameter(
                "direction cannot be set to stopped".into(),
            ));
        }
        state.direction = direction;
        Ok(())
    }

    fn current_direction(&self) -> Option<Direction> {
        lock(&self.state).current_direction
    }

    fn sender_track(&self) -> Option<Arc<dyn MediaTrack>> {
        lock(&self.state).sender.clone()
    }

    fn receiver_track(&self) -> Option<Arc<dyn MediaTrack>> {
        lock(&self.state).receiver.clone()
    }

    fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Err(EngineError::InvalidState("transceiver is stopped".into()));
        }
        if let Some(track) = &track {
            if track.kind() != self.kind {
                return Err(EngineError::InvalidParameter(format!(
                    "cannot send a {} track on a {} transceiver",
                    kind_str(track.kind()),
                    kind_str(self.kind)
                )));
            }
        }
        state.sender = track;
        Ok(())
    }

    async fn sender_stats(&self) -> Result<StatsReport> {
        let mut report = match self.sender_track() {
            Some(track) => self.sender_entries(track.as_ref()),
            None => Vec::new(),
        };
        report.push(transport_entry());
        report.push(codec_entry(self.kind));
        Ok(report)
    }

    async fn receiver_stats(&self) -> Result<StatsReport> {
        let mut report = match self.receiver_track() {
            Some(_) => self.receiver_entries(),
            None => Vec::new(),
        };
        report.push(transport_entry());
        report.push(codec_entry(self.kind));
        Ok(report)
    }
}

fn transport_entry() -> StatsEntry {
    let values = json!({
        "packetsSent": 0,
        "packetsReceived": 0,
        "bytesSent": 0,
        "bytesReceived": 0,
        "iceRole": "controlling",
        "dtlsState": "connected",
    });
    StatsEntry {
        id: TRANSPORT_STATS_ID.to_string(),
        kind: "transport".to_string(),
        timestamp: now(),
        values: match values {
            Value::Object(values) => values,
            _ => serde_json::Map::new(),
        },
    }
}

fn codec_entry(kind: MediaKind) -> StatsEntry {
    let (payload_type, mime_type) = match kind {
        MediaKind::Audio => (111, "audio/opus"),
        MediaKind::Video => (96, "video/VP8"),
    };
    let mut values = serde_json::Map::new();
    values.insert("payloadType".into(), json!(payload_type));
    values.insert("mimeType".into(), json!(mime_type));
    StatsEntry {
        id: format!("codec-{payload_type}"),
        kind: "codec".to_string(),
        timestamp: now(),
        values,
    }
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

impl Outbound {
    fn len(&self) -> usize {
        match self {
            Outbound::Text(text) => text.len(),
            Outbound::Binary(bytes) => bytes.len(),
        }
    }
}

struct DataChannelInner {
    ready_state: DataChannelState,
    transport_ready: bool,
    buffered_amount: usize,
    threshold: usize,
    pending: VecDeque<Outbound>,
    drain_scheduled: bool,
}

pub struct LoopbackDataChannel {
    parameters: DataChannelParameters,
    inner: Mutex<DataChannelInner>,
    subscribers: Subscribers<DataChannelEvent>,
    auto_drain: bool,
    this: Weak<LoopbackDataChannel>,
}

impl LoopbackDataChannel {
    fn new(
        parameters: DataChannelParameters,
        transport_ready: bool,
        auto_drain: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            parameters,
            inner: Mutex::new(DataChannelInner {
                ready_state: DataChannelState::Connecting,
                transport_ready,
                buffered_amount: 0,
                threshold: 0,
                pending: VecDeque::new(),
                drain_scheduled: false,
            }),
            subscribers: Subscribers::new(),
            auto_drain,
            this: this.clone(),
        })
    }

    /// Flush the buffer once the sender has had a chance to observe it.
    /// Outside a runtime the buffer is flushed immediately.
    fn schedule_drain(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.drain();
            return;
        };
        let channel = self.this.clone();
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(channel) = channel.upgrade() {
                channel.drain();
            }
        });
    }

    fn open(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.transport_ready = true;
            if inner.ready_state != DataChannelState::Connecting {
                return;
            }
            inner.ready_state = DataChannelState::Open;
        }
        self.subscribers.emit(DataChannelEvent::Open);
    }

    fn enqueue(&self, payload: Outbound) -> Result<()> {
        let schedule = {
            let mut inner = lock(&self.inner);
            if inner.ready_state != DataChannelState::Open {
                return Err(EngineError::InvalidState("data channel is not open".into()));
            }
            inner.buffered_amount += payload.len();
            inner.pending.push_back(payload);
            let schedule = self.auto_drain && !inner.drain_scheduled;
            inner.drain_scheduled |= schedule;
            schedule
        };
        if schedule {
            self.schedule_drain();
        }
        Ok(())
    }

    fn drain(&self) {
        let (pending, crossed_threshold) = {
            let mut inner = lock(&self.inner);
            inner.drain_scheduled = false;
            if inner.ready_state != DataChannelState::Open || inner.pending.is_empty() {
                return;
            }
            let crossed = inner.buffered_amount > inner.threshold;
            inner.buffered_amount = 0;
            (std::mem::take(&mut inner.pending), crossed)
        };

        for payload in pending {
            match payload {
                Outbound::Text(text) => self.subscribers.emit(DataChannelEvent::Message(text)),
                Outbound::Binary(bytes) => self.subscribers.emit(DataChannelEvent::Binary(bytes)),
            }
        }
        if crossed_threshold {
            self.subscribers.emit(DataChannelEvent::BufferedAmountLow);
        }
    }
}

impl DataChannel for LoopbackDataChannel {
    fn parameters(&self) -> DataChannelParameters {
        self.parameters.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        lock(&self.inner).ready_state
    }

    fn buffered_amount(&self) -> usize {
        lock(&self.inner).buffered_amount
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        lock(&self.inner).threshold
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        lock(&self.inner).threshold = threshold;
    }

    fn send_text(&self, text: &str) -> Result<()> {
        self.enqueue(Outbound::Text(text.to_string()))
    }

    fn send_binary(&self, bytes: &[u8]) -> Result<()> {
        self.enqueue(Outbound::Binary(bytes.to_vec()))
    }

    fn close(&self) {
        {
            let mut inner = lock(&self.inner);
            if matches!(
                inner.ready_state,
                DataChannelState::Closing | DataChannelState::Closed
            ) {
                return;
            }
            inner.ready_state = DataChannelState::Closed;
            inner.buffered_amount = 0;
            inner.pending.clear();
        }
        self.subscribers.emit(DataChannelEvent::Closing);
        self.subscribers.emit(DataChannelEvent::Close);
    }

    // A channel created on an established connection opens once someone listens.
    fn subscribe(&self, callback: EventCallback<DataChannelEvent>) {
        self.subscribers.add(callback);
        let ready = {
            let inner = lock(&self.inner);
            inner.transport_ready && inner.ready_state == DataChannelState::Connecting
        };
        if ready {
            self.open();
        }
    }
}

struct ConnectionState {
    signaling: SignalingState,
    ice_gathering: IceGatheringState,
    ice_connection: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    transceivers: Vec<Arc<LoopbackTransceiver>>,
    data_channels: Vec<Arc<LoopbackDataChannel>>,
    next_mid: usize,
    closed: bool,
}

impl ConnectionState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(EngineError::Closed("connection"));
        }
        Ok(())
    }

    fn assign_mids(&mut self) {
        for transceiver in &self.transceivers {
            let mut state = lock(&transceiver.state);
            if state.mid.is_none() {
                state.mid = Some(self.next_mid.to_string());
                self.next_mid += 1;
            }
        }
    }

    fn set_signaling(&mut self, next: SignalingState, events: &mut Vec<ConnectionEvent>) {
        if self.signaling != next {
            self.signaling = next;
            events.push(ConnectionEvent::SignalingStateChange(next));
        }
    }

    /// Once an offer/answer exchange completes, bring the transport up.
    fn settle(
        &mut self,
        events: &mut Vec<ConnectionEvent>,
        opened: &mut Vec<Arc<LoopbackDataChannel>>,
    ) {
        if self.signaling != SignalingState::Stable || self.local.is_none() || self.remote.is_none()
        {
            return;
        }

        for transceiver in &self.transceivers {
            let mut state = lock(&transceiver.state);
            if !state.stopped {
                state.current_direction = Some(state.direction);
            }
        }

        if self.ice_connection == IceConnectionState::New {
            self.ice_connection = IceConnectionState::Checking;
            events.push(ConnectionEvent::IceConnectionStateChange(
                IceConnectionState::Checking,
            ));
            self.ice_connection = IceConnectionState::Connected;
            events.push(ConnectionEvent::IceConnectionStateChange(
                IceConnectionState::Connected,
            ));
            opened.extend(self.data_channels.iter().cloned());
        }
    }

    fn render_sdp(&self, session: u64) -> String {
        let mut sdp = String::new();
        let _ = write!(
            sdp,
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            1000 + session
        );
        for transceiver in &self.transceivers {
            let state = lock(&transceiver.state);
            let Some(mid) = &state.mid else {
                continue;
            };
            let _ = write!(
                sdp,
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na={}\r\n",
                kind_str(transceiver.kind),
                direction_str(state.direction)
            );
            if let Some(track) = &state.sender {
                let _ = write!(sdp, "a=msid:- {}\r\n", track.id());
            }
        }
        if !self.data_channels.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        sdp
    }
}

/// `(kind, mid)` of every audio/video section in `sdp`.
/// Even stream ids in creation order, as the offering side picks them.
fn next_stream_id(created: usize) -> Result<u16> {
    created
        .checked_mul(2)
        .and_then(|id| u16::try_from(id).ok())
        .ok_or_else(|| EngineError::InvalidParameter("no free data channel stream id".into()))
}

fn media_sections(sdp: &str) -> Vec<(MediaKind, String)> {
    let mut sections = Vec::new();
    let mut current = None;
    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            current = if media.starts_with("audio") {
                Some(MediaKind::Audio)
            } else if media.starts_with("video") {
                Some(MediaKind::Video)
            } else {
                None
            };
        } else if let Some(mid) = line.strip_prefix("a=mid:") {
            if let Some(kind) = current.take() {
                sections.push((kind, mid.to_string()));
            }
        }
    }
    sections
}

pub struct LoopbackConnection {
    id: u64,
    shared: Arc<Shared>,
    state: Mutex<ConnectionState>,
    subscribers: Subscribers<ConnectionEvent>,
}

impl LoopbackConnection {
    fn new(id: u64, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            state: Mutex::new(ConnectionState {
                signaling: SignalingState::Stable,
                ice_gathering: IceGatheringState::New,
                ice_connection: IceConnectionState::New,
                local: None,
                remote: None,
                transceivers: Vec::new(),
                data_channels: Vec::new(),
                next_mid: 0,
                closed: false,
            }),
            subscribers: Subscribers::new(),
        }
    }

    fn next_ssrc(&self, state: &ConnectionState) -> u32 {
        1000 + state.transceivers.len() as u32
    }

    fn publish(&self, events: Vec<ConnectionEvent>, opened: Vec<Arc<LoopbackDataChannel>>) {
        for event in events {
            self.subscribers.emit(event);
        }
        for channel in opened {
            channel.open();
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        lock(&self.state).ice_gathering
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        lock(&self.state).ice_connection
    }

    fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = lock(&self.state);
        state.ensure_open()?;
        state.assign_mids();
        Ok(SessionDescription {
            kind: SdpType::Offer,
            sdp: state.render_sdp(self.id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = lock(&self.state);
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(EngineError::InvalidState(format!(
                "cannot create an answer in signaling state {:?}",
                state.signaling
            )));
        }
        Ok(SessionDescription {
            kind: SdpType::Answer,
            sdp: state.render_sdp(self.id),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        let mut opened = Vec::new();
        {
            let mut state = lock(&self.state);
            state.ensure_open()?;
            let next = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveRemoteOffer) => {
                    SignalingState::Stable
                }
                (SdpType::Rollback, _) => SignalingState::Stable,
                (kind, current) => {
                    return Err(EngineError::InvalidState(format!(
                        "cannot set local {kind:?} in signaling state {current:?}"
                    )))
                }
            };

            state.assign_mids();
            state.local = match description.kind {
                SdpType::Rollback => None,
                _ => Some(description),
            };
            state.set_signaling(next, &mut events);

            if state.local.is_some() && state.ice_gathering == IceGatheringState::New {
                events.push(ConnectionEvent::IceGatheringStateChange(
                    IceGatheringState::Gathering,
                ));
                events.push(ConnectionEvent::IceGatheringStateChange(
                    IceGatheringState::Complete,
                ));
                state.ice_gathering = IceGatheringState::Complete;
            }
            state.settle(&mut events, &mut opened);
        }
        self.publish(events, opened);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        let mut opened = Vec::new();
        {
            let mut state = lock(&self.state);
            state.ensure_open()?;
            let next = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                    SignalingState::Stable
                }
                (SdpType::Rollback, _) => SignalingState::Stable,
                (kind, current) => {
                    return Err(EngineError::InvalidState(format!(
                        "cannot set remote {kind:?} in signaling state {current:?}"
                    )))
                }
            };

            if description.kind == SdpType::Offer {
                for (kind, mid) in media_sections(&description.sdp) {
                    let known = state
                        .transceivers
                        .iter()
                        .any(|transceiver| transceiver.mid().as_deref() == Some(mid.as_str()));
                    if known {
                        continue;
                    }

                    let transceiver =
                        LoopbackTransceiver::new(kind, self.next_ssrc(&state), Direction::Recvonly);
                    let track: Arc<dyn MediaTrack> = Arc::new(LoopbackTrack::new(
                        format!("remote{}-{mid}", self.id),
                        kind,
                        self.shared.clone(),
                    ));
                    {
                        let mut transceiver_state = lock(&transceiver.state);
                        transceiver_state.mid = Some(mid.clone());
                        transceiver_state.receiver = Some(track.clone());
                    }
                    if let Ok(index) = mid.parse::<usize>() {
                        state.next_mid = state.next_mid.max(index + 1);
                    }
                    state.transceivers.push(Arc::new(transceiver));
                    events.push(ConnectionEvent::Track(track));
                }
            }

            state.remote = match description.kind {
                SdpType::Rollback => None,
                _ => Some(description),
            };
            state.set_signaling(next, &mut events);
            state.settle(&mut events, &mut opened);
        }
        self.publish(events, opened);
        Ok(())
    }

    fn add_transceiver(&self, init: TransceiverInit) -> Result<Arc<dyn Transceiver>> {
        let mut state = lock(&self.state);
        state.ensure_open()?;

        let ssrc = self.next_ssrc(&state);
        let transceiver = match init {
            TransceiverInit::Track(track) => {
                let transceiver = LoopbackTransceiver::new(track.kind(), ssrc, Direction::Sendrecv);
                lock(&transceiver.state).sender = Some(track);
                transceiver
            }
            TransceiverInit::Kind(kind, direction) => {
                LoopbackTransceiver::new(kind, ssrc, direction)
            }
        };
        let transceiver = Arc::new(transceiver);
        state.transceivers.push(transceiver.clone());
        Ok(transceiver)
    }

    fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        lock(&self.state)
            .transceivers
            .iter()
            .map(|transceiver| transceiver.clone() as Arc<dyn Transceiver>)
            .collect()
    }

    async fn stats(&self) -> Result<StatsReport> {
        let transceivers = {
            let state = lock(&self.state);
            state.ensure_open()?;
            state.transceivers.clone()
        };

        let mut report = Vec::new();
        for transceiver in &transceivers {
            if let Some(track) = transceiver.sender_track() {
                report.extend(transceiver.sender_entries(track.as_ref()));
            }
            if transceiver.receiver_track().is_some() {
                report.extend(transceiver.receiver_entries());
            }
            report.push(codec_entry(transceiver.kind));
        }
        report.push(transport_entry());
        Ok(report)
    }

    fn create_data_channel(&self, init: DataChannelInit) -> Result<Arc<dyn DataChannel>> {
        let mut state = lock(&self.state);
        state.ensure_open()?;

        if init.max_packet_life_time.is_some() && init.max_retransmits.is_some() {
            return Err(EngineError::InvalidParameter(
                "maxPacketLifeTime and maxRetransmits are mutually exclusive".into(),
            ));
        }

        let stream_id = match init.id {
            Some(id) => id,
            None => next_stream_id(state.data_channels.len())?,
        };
        let in_use = state.data_channels.iter().any(|channel| {
            channel.parameters.stream_id == Some(stream_id)
                && channel.ready_state() != DataChannelState::Closed
        });
        if in_use {
            return Err(EngineError::InvalidParameter(format!(
                "stream id {stream_id} is already in use"
            )));
        }

        let parameters = DataChannelParameters {
            stream_id: Some(stream_id),
            ordered: init.ordered.unwrap_or(true),
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            label: init.label.unwrap_or_default(),
            protocol: init.protocol.unwrap_or_default(),
        };
        let transport_ready = state.ice_connection == IceConnectionState::Connected;
        let channel = LoopbackDataChannel::new(parameters, transport_ready, self.shared.auto_drain);

        state.data_channels.push(channel.clone());
        lock(&self.shared.data_channels).push(Arc::downgrade(&channel));
        Ok(channel)
    }

    fn subscribe(&self, callback: EventCallback<ConnectionEvent>) {
        self.subscribers.add(callback);
    }

    async fn close(&self) {
        self.shared
            .connection_close_calls
            .fetch_add(1, Ordering::AcqRel);

        let (transceivers, channels) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.ice_connection = IceConnectionState::Closed;
            (state.transceivers.clone(), state.data_channels.clone())
        };
        self.shared.connections_closed.fetch_add(1, Ordering::AcqRel);
        debug!(connection = self.id, "loopback connection closed");

        for transceiver in &transceivers {
            transceiver.stop();
        }
        for channel in &channels {
            channel.close();
        }
        self.subscribers
            .emit(ConnectionEvent::SignalingStateChange(SignalingState::Closed));
        self.subscribers
            .emit(ConnectionEvent::IceConnectionStateChange(
                IceConnectionState::Closed,
            ));
    }
}
