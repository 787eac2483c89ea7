//! The handler entity: one engine connection plus its data channels.
//!
//! Each handler owns two background notifiers spawned on the worker's task
//! tracker. The forwarder relays engine callbacks to the host as they arrive;
//! the sampler reports the buffered amount of every live data channel on a
//! fixed period. Both stop when the handler's token is cancelled, which
//! happens on handler close and on worker shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rtcworker_channel::{Channel, ChannelError};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::command::{AttachTrack, HandlerNotification, HandlerRequest, TrackRef};
use crate::engine::{
    ConnectionEvent, DataChannel, DataChannelEvent, DataChannelInit, DataChannelState, Direction,
    MediaTrack, PeerConnection, StatsReport, Transceiver, TransceiverInit,
};
use crate::error::{Result, WorkerError};
use crate::player::Player;
use crate::registry::Registry;

const TRANSPORT_STATS: &[&str] = &[
    "inbound-rtp",
    "outbound-rtp",
    "remote-inbound-rtp",
    "remote-outbound-rtp",
    "transport",
];
const SENDER_STATS: &[&str] = &["outbound-rtp", "remote-inbound-rtp", "transport"];
const RECEIVER_STATS: &[&str] = &["inbound-rtp", "remote-outbound-rtp", "transport"];

/// Worker-wide resources a handler needs to run its notifiers.
#[derive(Clone)]
pub struct HandlerContext {
    pub channel: Arc<Channel>,
    pub remote_tracks: Arc<Registry<dyn MediaTrack>>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    pub buffered_amount_interval: Duration,
}

/// Entities a track reference may resolve against.
pub struct TrackLookup<'a> {
    pub players: &'a Registry<Player>,
    pub remote_tracks: &'a Registry<dyn MediaTrack>,
}

impl TrackLookup<'_> {
    fn resolve(&self, attach: &AttachTrack) -> Result<Arc<dyn MediaTrack>> {
        let track = match &attach.source {
            TrackRef::Player(player_id) => self.players.get(player_id)?.track(attach.kind)?,
            TrackRef::Remote(track_id) => self.remote_tracks.get(track_id)?,
        };
        if track.kind() != attach.kind {
            return Err(WorkerError::validation(format!(
                "track \"{}\" is not of kind {}",
                track.id(),
                json!(attach.kind).as_str().unwrap_or_default()
            )));
        }
        Ok(track)
    }
}

enum HandlerEvent {
    Connection(ConnectionEvent),
    DataChannel { id: String, event: DataChannelEvent },
}

pub struct Handler {
    id: String,
    connection: Arc<dyn PeerConnection>,
    channel: Arc<Channel>,
    send_transceivers: Mutex<BTreeMap<String, Arc<dyn Transceiver>>>,
    data_channels: Arc<Registry<dyn DataChannel>>,
    events: mpsc::UnboundedSender<HandlerEvent>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl Handler {
    /// Wrap `connection` and start its notifiers.
    pub fn start(id: String, connection: Arc<dyn PeerConnection>, context: &HandlerContext) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let token = context.shutdown.child_token();
        let data_channels: Arc<Registry<dyn DataChannel>> = Arc::new(Registry::new("dataChannel"));

        let sender = events.clone();
        connection.subscribe(Arc::new(move |event: ConnectionEvent| {
            let _ = sender.send(HandlerEvent::Connection(event));
        }));

        context.tasks.spawn(forward_events(
            Forwarder {
                handler_id: id.clone(),
                channel: context.channel.clone(),
                data_channels: data_channels.clone(),
                remote_tracks: context.remote_tracks.clone(),
            },
            rx,
            token.clone(),
        ));
        context.tasks.spawn(sample_buffered_amount(
            context.channel.clone(),
            data_channels.clone(),
            token.clone(),
            context.buffered_amount_interval,
        ));
        debug!(handler_id = %id, "handler started");

        Arc::new(Self {
            id,
            connection,
            channel: context.channel.clone(),
            send_transceivers: Mutex::new(BTreeMap::new()),
            data_channels,
            events,
            token,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn handle(
        &self,
        request: HandlerRequest,
        tracks: &TrackLookup<'_>,
    ) -> Result<Option<Value>> {
        match request {
            HandlerRequest::Close => {
                self.close().await;
                Ok(None)
            }
            HandlerRequest::GetLocalDescription => {
                Ok(self.connection.local_description().map(|desc| json!(desc)))
            }
            HandlerRequest::CreateOffer => {
                let offer = self.connection.create_offer().await?;
                Ok(Some(json!(offer)))
            }
            HandlerRequest::CreateAnswer => {
                let answer = self.connection.create_answer().await?;
                Ok(Some(json!(answer)))
            }
            HandlerRequest::SetLocalDescription(description) => {
                self.connection.set_local_description(description).await?;
                Ok(None)
            }
            HandlerRequest::SetRemoteDescription(description) => {
                self.connection.set_remote_description(description).await?;
                Ok(None)
            }
            HandlerRequest::GetMid { local_id } => {
                let transceiver = self.send_transceiver(&local_id)?;
                Ok(transceiver.mid().map(Value::from))
            }
            HandlerRequest::AddTrack(attach) => {
                if self.send_transceivers().contains_key(&attach.local_id) {
                    return Err(WorkerError::Failed(format!(
                        "localId \"{}\" already exists",
                        attach.local_id
                    )));
                }
                let track = tracks.resolve(&attach)?;
                let transceiver = self
                    .connection
                    .add_transceiver(TransceiverInit::Track(track))?;
                self.send_transceivers()
                    .insert(attach.local_id, transceiver);
                Ok(None)
            }
            HandlerRequest::RemoveTrack { local_id } => {
                let transceiver = self.send_transceiver(&local_id)?;
                transceiver.set_direction(Direction::Inactive)?;
                transceiver.replace_track(None)?;
                Ok(None)
            }
            HandlerRequest::ReplaceTrack(attach) => {
                let transceiver = self.send_transceiver(&attach.local_id)?;
                let track = tracks.resolve(&attach)?;
                transceiver.replace_track(Some(track))?;
                Ok(None)
            }
            HandlerRequest::SetTrackDirection {
                local_id,
                direction,
            } => {
                self.send_transceiver(&local_id)?.set_direction(direction)?;
                Ok(None)
            }
            HandlerRequest::GetTransportStats => {
                let report = self.connection.stats().await?;
                Ok(Some(stats_object(report, TRANSPORT_STATS)))
            }
            HandlerRequest::GetSenderStats { mid } => {
                let report = self.transceiver_by_mid(&mid)?.sender_stats().await?;
                Ok(Some(stats_object(report, SENDER_STATS)))
            }
            HandlerRequest::GetReceiverStats { mid } => {
                let report = self.transceiver_by_mid(&mid)?.receiver_stats().await?;
                Ok(Some(stats_object(report, RECEIVER_STATS)))
            }
            HandlerRequest::CreateDataChannel {
                data_channel_id,
                init,
            } => self.create_data_channel(data_channel_id, init).map(Some),
        }
    }

    pub async fn notify(&self, notification: HandlerNotification) -> Result<()> {
        match notification {
            HandlerNotification::Close => self.close().await,
            HandlerNotification::EnableTrack | HandlerNotification::DisableTrack => {
                warn!(handler_id = %self.id, "track enable/disable is not supported");
            }
            HandlerNotification::SendText {
                data_channel_id,
                text,
            } => {
                let data_channel = self.data_channels.get(&data_channel_id)?;
                data_channel.send_text(&text)?;
                self.report_buffered_amount(data_channel_id, data_channel.as_ref())
                    .await?;
            }
            HandlerNotification::SendBinary {
                data_channel_id,
                bytes,
            } => {
                let data_channel = self.data_channels.get(&data_channel_id)?;
                data_channel.send_binary(&bytes)?;
                self.report_buffered_amount(data_channel_id, data_channel.as_ref())
                    .await?;
            }
            HandlerNotification::CloseDataChannel { data_channel_id } => {
                // Removed first: the host asked for it, so the engine's close
                // events find no entry and are not echoed back.
                match self.data_channels.remove(&data_channel_id) {
                    Some(data_channel) => data_channel.close(),
                    None => debug!(%data_channel_id, "data channel already gone"),
                }
            }
            HandlerNotification::SetBufferedAmountLowThreshold {
                data_channel_id,
                threshold,
            } => {
                self.data_channels
                    .get(&data_channel_id)?
                    .set_buffered_amount_low_threshold(threshold);
            }
        }
        Ok(())
    }

    /// Stop the notifiers and close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        self.data_channels.drain();
        self.send_transceivers().clear();
        self.connection.close().await;
        debug!(handler_id = %self.id, "handler closed");
    }

    pub fn dump(&self) -> Value {
        let transceivers: Vec<Value> = self
            .connection
            .transceivers()
            .iter()
            .map(|transceiver| {
                json!({
                    "mid": transceiver.mid(),
                    "stopped": transceiver.stopped(),
                    "kind": transceiver.kind(),
                    "currentDirection": transceiver.current_direction(),
                    "direction": transceiver.direction(),
                    "sender": { "trackId": transceiver.sender_track().map(|t| t.id().to_string()) },
                    "receiver": { "trackId": transceiver.receiver_track().map(|t| t.id().to_string()) },
                })
            })
            .collect();
        let send_transceivers: Vec<Value> = self
            .send_transceivers()
            .iter()
            .map(|(local_id, transceiver)| json!({ "localId": local_id, "mid": transceiver.mid() }))
            .collect();
        let data_channels: Vec<Value> = self
            .data_channels
            .snapshot()
            .into_iter()
            .map(|(id, data_channel)| {
                json!({
                    "id": id,
                    "streamId": data_channel.parameters().stream_id,
                    "label": data_channel.parameters().label,
                    "readyState": data_channel.ready_state(),
                    "bufferedAmount": data_channel.buffered_amount(),
                })
            })
            .collect();

        json!({
            "id": self.id,
            "signalingState": self.connection.signaling_state(),
            "iceConnectionState": self.connection.ice_connection_state(),
            "iceGatheringState": self.connection.ice_gathering_state(),
            "transceivers": transceivers,
            "sendTransceivers": send_transceivers,
            "dataChannels": data_channels,
        })
    }

    fn create_data_channel(
        &self,
        data_channel_id: String,
        init: DataChannelInit,
    ) -> Result<Value> {
        self.data_channels.ensure_vacant(&data_channel_id)?;
        let data_channel = self.connection.create_data_channel(init)?;
        self.data_channels
            .insert(data_channel_id.clone(), data_channel.clone())?;

        let sender = self.events.clone();
        let id = data_channel_id.clone();
        data_channel.subscribe(Arc::new(move |event: DataChannelEvent| {
            let _ = sender.send(HandlerEvent::DataChannel {
                id: id.clone(),
                event,
            });
        }));
        debug!(handler_id = %self.id, %data_channel_id, "data channel created");

        let parameters = data_channel.parameters();
        Ok(json!({
            "streamId": parameters.stream_id,
            "ordered": parameters.ordered,
            "maxPacketLifeTime": parameters.max_packet_life_time,
            "maxRetransmits": parameters.max_retransmits,
            "label": parameters.label,
            "protocol": parameters.protocol,
            "readyState": data_channel.ready_state(),
            "bufferedAmount": data_channel.buffered_amount(),
            "bufferedAmountLowThreshold": data_channel.buffered_amount_low_threshold(),
        }))
    }

    async fn report_buffered_amount(
        &self,
        data_channel_id: String,
        data_channel: &dyn DataChannel,
    ) -> Result<()> {
        self.channel
            .notify(
                data_channel_id,
                "bufferedamount",
                Some(json!(data_channel.buffered_amount())),
            )
            .await?;
        Ok(())
    }

    fn send_transceiver(&self, local_id: &str) -> Result<Arc<dyn Transceiver>> {
        self.send_transceivers()
            .get(local_id)
            .cloned()
            .ok_or_else(|| WorkerError::Failed(format!("localId \"{local_id}\" not found")))
    }

    fn transceiver_by_mid(&self, mid: &str) -> Result<Arc<dyn Transceiver>> {
        self.connection
            .transceivers()
            .into_iter()
            .find(|transceiver| transceiver.mid().as_deref() == Some(mid))
            .ok_or_else(|| WorkerError::Failed(format!("transceiver with mid \"{mid}\" not found")))
    }

    fn send_transceivers(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn Transceiver>>> {
        self.send_transceivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn stats_object(report: StatsReport, kinds: &[&str]) -> Value {
    let mut object = Map::new();
    for entry in report {
        if kinds.contains(&entry.kind.as_str()) {
            object.insert(entry.id.clone(), entry.to_json());
        }
    }
    Value::Object(object)
}

struct Forwarder {
    handler_id: String,
    channel: Arc<Channel>,
    data_channels: Arc<Registry<dyn DataChannel>>,
    remote_tracks: Arc<Registry<dyn MediaTrack>>,
}

impl Forwarder {
    async fn forward(&self, event: HandlerEvent) -> std::result::Result<(), ChannelError> {
        match event {
            HandlerEvent::Connection(ConnectionEvent::SignalingStateChange(state)) => {
                self.notify_handler("signalingstatechange", json!(state)).await
            }
            HandlerEvent::Connection(ConnectionEvent::IceGatheringStateChange(state)) => {
                self.notify_handler("icegatheringstatechange", json!(state))
                    .await
            }
            HandlerEvent::Connection(ConnectionEvent::IceConnectionStateChange(state)) => {
                self.notify_handler("iceconnectionstatechange", json!(state))
                    .await
            }
            HandlerEvent::Connection(ConnectionEvent::Track(track)) => {
                let track_id = track.id().to_string();
                if let Err(err) = self.remote_tracks.insert(track_id.clone(), track) {
                    debug!(handler_id = %self.handler_id, error = %err, "remote track not recorded");
                } else {
                    debug!(handler_id = %self.handler_id, %track_id, "remote track recorded");
                }
                Ok(())
            }
            HandlerEvent::DataChannel {
                id,
                event: DataChannelEvent::Close,
            } => {
                if self.data_channels.remove(&id).is_none() {
                    return Ok(());
                }
                self.channel.notify(id, "close", None).await
            }
            HandlerEvent::DataChannel { id, event } => {
                // Events for a data channel that is no longer registered are dropped.
                if !self.data_channels.contains(&id) {
                    return Ok(());
                }
                let (name, data) = match event {
                    DataChannelEvent::Open => ("open", None),
                    DataChannelEvent::Closing => ("closing", None),
                    DataChannelEvent::Message(text) => ("message", Some(Value::from(text))),
                    DataChannelEvent::Binary(bytes) => {
                        ("binary", Some(Value::from(base64::encode(bytes))))
                    }
                    DataChannelEvent::BufferedAmountLow => ("bufferedamountlow", None),
                    DataChannelEvent::Close => return Ok(()),
                };
                self.channel.notify(id, name, data).await
            }
        }
    }

    async fn notify_handler(&self, event: &str, data: Value) -> std::result::Result<(), ChannelError> {
        self.channel
            .notify(self.handler_id.as_str(), event, Some(data))
            .await
    }
}

async fn forward_events(
    forwarder: Forwarder,
    mut rx: mpsc::UnboundedReceiver<HandlerEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(err) = forwarder.forward(event).await {
            if err.is_fatal() {
                debug!(handler_id = %forwarder.handler_id, error = %err, "event forwarder stopped");
                break;
            }
            warn!(handler_id = %forwarder.handler_id, error = %err, "failed to forward event");
        }
    }
}

async fn sample_buffered_amount(
    channel: Arc<Channel>,
    data_channels: Arc<Registry<dyn DataChannel>>,
    token: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for (id, data_channel) in data_channels.snapshot() {
            if !matches!(
                data_channel.ready_state(),
                DataChannelState::Connecting | DataChannelState::Open
            ) {
                continue;
            }
            let amount = data_channel.buffered_amount();
            if let Err(err) = channel
                .notify(id, "bufferedamount", Some(json!(amount)))
                .await
            {
                if err.is_fatal() {
                    debug!(error = %err, "buffered amount sampler stopped");
                    return;
                }
                warn!(error = %err, "failed to report buffered amount");
            }
        }
    }
}
