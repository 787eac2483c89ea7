//! Dispatcher: the worker's receive loop and lifecycle.
//!
//! ```text
//! Idle --first message--> Running --disconnect / stop--> ShuttingDown --> Stopped
//! ```
//!
//! Requests are served one at a time, so responses leave in arrival order.
//! Background notifiers write to the same channel concurrently; the channel
//! keeps their frames whole.

use std::sync::Arc;

use rtcworker_channel::{
    Channel, ChannelError, ErrorKind, Id, Message, Notification, Request, Response,
};
use rtcworker_transport::Endpoints;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::command::{
    CommandTable, HandlerNotification, HandlerRequest, NotificationCommand, RequestCommand,
};
use crate::engine::{
    Direction, MediaEngine, MediaKind, RtcConfiguration, SessionDescription, SourceDescriptor,
    TransceiverInit,
};
use crate::error::Result;
use crate::handler::{Handler, HandlerContext, TrackLookup};
use crate::player::Player;
use crate::registry::Registry;
use crate::settings::WorkerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Worker {
    engine: Arc<dyn MediaEngine>,
    settings: WorkerSettings,
    commands: CommandTable,
    handlers: Registry<Handler>,
    players: Registry<Player>,
    context: HandlerContext,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(endpoints: Endpoints, engine: Arc<dyn MediaEngine>, settings: WorkerSettings) -> Self {
        let channel = Arc::new(Channel::with_config(endpoints, settings.frame.clone()));
        let context = HandlerContext {
            channel,
            remote_tracks: Arc::new(Registry::new("track")),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            buffered_amount_interval: settings.buffered_amount_interval,
        };
        let (state, _) = watch::channel(WorkerState::Idle);

        Self {
            engine,
            settings,
            commands: CommandTable::new(),
            handlers: Registry::new("handler"),
            players: Registry::new("player"),
            context,
            state,
        }
    }

    /// Cancelling this token stops the worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Announce liveness and serve the host until it disconnects or a stop is
    /// requested. Always finishes with [`Worker::shutdown`].
    ///
    /// Only framing and transport failures are returned; everything else is
    /// answered on the wire or logged.
    pub async fn run(&self) -> Result<()> {
        let result = self.serve().await;
        if let Err(err) = &result {
            warn!(error = %err, "worker loop failed");
        }
        self.shutdown().await;
        result
    }

    async fn serve(&self) -> Result<()> {
        let channel = &self.context.channel;
        channel.connect().await?;
        channel.notify(self.settings.pid, "running", None).await?;
        info!(pid = self.settings.pid, "worker running");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.context.shutdown.cancelled() => {
                    info!("stop requested");
                    return Ok(());
                }
                received = channel.receive() => received,
            };

            match received {
                Ok(message) => {
                    self.state.send_if_modified(|state| {
                        if *state == WorkerState::Idle {
                            *state = WorkerState::Running;
                            true
                        } else {
                            false
                        }
                    });
                    self.dispatch(message).await?;
                }
                Err(ChannelError::Disconnected) => {
                    info!("host disconnected");
                    return Ok(());
                }
                Err(err) if !err.is_fatal() => {
                    warn!(error = %err, "dropping undecodable message");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn dispatch(&self, message: Message) -> Result<()> {
        match message {
            Message::Request(request) => {
                let outcome = self.handle_request(&request).await;
                let response = match outcome {
                    Ok(data) => Response::accepted(request.id.clone(), data),
                    Err(err) => {
                        warn!(method = %request.method, id = %request.id, error = %err, "request failed");
                        Response::rejected(request.id.clone(), err.kind(), err.to_string())
                    }
                };
                self.respond(request.id, response).await?;
            }
            Message::Notification(notification) => {
                if let Err(err) = self.handle_notification(&notification).await {
                    warn!(event = %notification.event, error = %err, "notification failed");
                }
            }
            Message::Response(response) => {
                warn!(id = %response.id(), "ignoring response from host");
            }
        }
        Ok(())
    }

    /// Write `response`. One that cannot be sent is replaced by an error
    /// response so the request is still answered.
    async fn respond(&self, id: Id, response: Response) -> Result<()> {
        let channel = &self.context.channel;
        let err = match channel.send(&Message::Response(response)).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => err,
        };
        warn!(%id, error = %err, "response not sent");

        let fallback = Response::rejected(id, ErrorKind::Generic, err.to_string());
        match channel.send(&Message::Response(fallback)).await {
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "error response not sent");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn handle_request(&self, request: &Request) -> Result<Option<Value>> {
        debug!(method = %request.method, id = %request.id, "request");

        match self.commands.decode_request(request)? {
            RequestCommand::GetRtpCapabilities => self.rtp_capabilities().await.map(Some),
            RequestCommand::Dump => Ok(Some(self.dump())),
            RequestCommand::CreatePlayer { player_id, source } => {
                self.create_player(player_id, &source).await?;
                Ok(None)
            }
            RequestCommand::CreateHandler {
                handler_id,
                rtc_configuration,
            } => {
                self.create_handler(handler_id, rtc_configuration).await?;
                Ok(None)
            }
            RequestCommand::ClosePlayer { player_id } => {
                self.close_player(&player_id);
                Ok(None)
            }
            RequestCommand::Handler {
                handler_id,
                request: HandlerRequest::Close,
            } => {
                self.close_handler(&handler_id).await;
                Ok(None)
            }
            RequestCommand::Handler {
                handler_id,
                request,
            } => {
                let handler = self.handlers.get(&handler_id)?;
                handler.handle(request, &self.track_lookup()).await
            }
        }
    }

    async fn handle_notification(&self, notification: &Notification) -> Result<()> {
        debug!(event = %notification.event, "notification");

        match self.commands.decode_notification(notification)? {
            NotificationCommand::ClosePlayer { player_id } => self.close_player(&player_id),
            NotificationCommand::StopPlayerTrack { player_id, kind } => {
                self.players.get(&player_id)?.stop_track(kind)?;
            }
            NotificationCommand::Handler {
                handler_id,
                notification: HandlerNotification::Close,
            } => self.close_handler(&handler_id).await,
            NotificationCommand::Handler {
                handler_id,
                notification,
            } => {
                self.handlers.get(&handler_id)?.notify(notification).await?;
            }
        }
        Ok(())
    }

    async fn create_player(&self, player_id: String, source: &SourceDescriptor) -> Result<()> {
        self.players.ensure_vacant(&player_id)?;
        let player = Arc::new(Player::open(player_id.clone(), self.engine.as_ref(), source).await?);
        if let Err(err) = self.players.insert(player_id.clone(), player.clone()) {
            player.close();
            return Err(err.into());
        }
        info!(%player_id, "player created");
        Ok(())
    }

    async fn create_handler(
        &self,
        handler_id: String,
        rtc_configuration: Option<RtcConfiguration>,
    ) -> Result<()> {
        self.handlers.ensure_vacant(&handler_id)?;
        let configuration = rtc_configuration.or_else(|| self.settings.rtc_configuration.clone());
        let connection = self.engine.create_connection(configuration).await?;

        let handler = Handler::start(handler_id.clone(), connection, &self.context);
        if let Err(err) = self.handlers.insert(handler_id.clone(), handler.clone()) {
            handler.close().await;
            return Err(err.into());
        }
        info!(%handler_id, "handler created");
        Ok(())
    }

    /// Absent ids are ignored so that repeated closes are harmless.
    async fn close_handler(&self, handler_id: &str) {
        match self.handlers.remove(handler_id) {
            Some(handler) => {
                handler.close().await;
                info!(%handler_id, "handler closed");
            }
            None => debug!(%handler_id, "handler already closed"),
        }
    }

    fn close_player(&self, player_id: &str) {
        match self.players.remove(player_id) {
            Some(player) => {
                player.close();
                info!(%player_id, "player closed");
            }
            None => debug!(%player_id, "player already closed"),
        }
    }

    /// SDP of an offer carrying one send-only section per media kind.
    async fn rtp_capabilities(&self) -> Result<Value> {
        let connection = self.engine.create_connection(None).await?;
        let offer: crate::engine::Result<SessionDescription> = async {
            connection.add_transceiver(TransceiverInit::Kind(MediaKind::Audio, Direction::Sendonly))?;
            connection.add_transceiver(TransceiverInit::Kind(MediaKind::Video, Direction::Sendonly))?;
            connection.create_offer().await
        }
        .await;
        connection.close().await;
        Ok(Value::from(offer?.sdp))
    }

    fn dump(&self) -> Value {
        let players: Vec<Value> = self
            .players
            .snapshot()
            .iter()
            .map(|(_, player)| player.dump())
            .collect();
        let handlers: Vec<Value> = self
            .handlers
            .snapshot()
            .iter()
            .map(|(_, handler)| handler.dump())
            .collect();

        json!({
            "pid": self.settings.pid,
            "players": players,
            "handlers": handlers,
        })
    }

    fn track_lookup(&self) -> TrackLookup<'_> {
        TrackLookup {
            players: &self.players,
            remote_tracks: &self.context.remote_tracks,
        }
    }

    /// Stop every notifier, close every entity once, then release the channel.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let started = self.state.send_if_modified(|state| match state {
            WorkerState::ShuttingDown | WorkerState::Stopped => false,
            _ => {
                *state = WorkerState::ShuttingDown;
                true
            }
        });
        if !started {
            return;
        }
        info!(
            handlers = self.handlers.len(),
            players = self.players.len(),
            "worker shutting down"
        );

        self.context.shutdown.cancel();
        for (_, handler) in self.handlers.drain() {
            handler.close().await;
        }
        for (_, player) in self.players.drain() {
            player.close();
        }
        self.context.remote_tracks.drain();

        self.context.tasks.close();
        self.context.tasks.wait().await;

        if let Err(err) = self.context.channel.close().await {
            warn!(error = %err, "failed to close channel");
        }
        self.state.send_replace(WorkerState::Stopped);
        info!("worker stopped");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("state", &self.state())
            .field("handlers", &self.handlers)
            .field("players", &self.players)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rtcworker_channel::Internal;
    use rtcworker_frame::{FrameConfig, Framer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::engine::LoopbackEngine;

    fn worker() -> (Worker, Arc<LoopbackEngine>, DuplexStream) {
        let (local, host) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let engine = Arc::new(LoopbackEngine::new());
        let settings = WorkerSettings {
            pid: 4242,
            ..WorkerSettings::default()
        };
        let worker = Worker::new(Endpoints::from_io(reader, writer), engine.clone(), settings);
        (worker, engine, host)
    }

    async fn send(host: &mut DuplexStream, message: impl Into<Message>) {
        let payload = message.into().encode().unwrap();
        host.write_all(&rtcworker_frame::encode(&payload))
            .await
            .unwrap();
    }

    fn decode_all(wire: &[u8]) -> Vec<Message> {
        Framer::new()
            .feed(wire)
            .unwrap()
            .iter()
            .map(|frame| Message::decode(frame).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn announces_liveness_and_stops_on_disconnect() {
        let (worker, _engine, mut host) = worker();
        let mut states = worker.subscribe_state();

        let run = tokio::spawn(async move {
            worker.run().await.unwrap();
            worker.state()
        });

        send(&mut host, Request::new(1u32, "dump")).await;
        host.shutdown().await.unwrap();
        let mut wire = Vec::new();
        host.read_to_end(&mut wire).await.unwrap();

        assert_eq!(run.await.unwrap(), WorkerState::Stopped);
        assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);

        let messages = decode_all(&wire);
        assert_eq!(
            messages[0],
            Message::Notification(Notification::targeted(4242u32, "running", None))
        );
        let Message::Response(Response::Accepted { data: Some(dump), .. }) = &messages[1] else {
            panic!("expected dump response, got {:?}", messages[1]);
        };
        assert_eq!(dump["pid"], 4242);
    }

    #[tokio::test]
    async fn unknown_handler_is_an_error_response() {
        let (worker, _engine, mut host) = worker();
        let run = tokio::spawn(async move { worker.run().await });

        send(
            &mut host,
            Request::new(7u32, "handler.createOffer").with_internal(Internal::handler("nope")),
        )
        .await;
        host.shutdown().await.unwrap();
        let mut wire = Vec::new();
        host.read_to_end(&mut wire).await.unwrap();
        run.await.unwrap().unwrap();

        let messages = decode_all(&wire);
        assert_eq!(
            messages[1],
            Message::Response(Response::rejected(
                7u32.into(),
                ErrorKind::Generic,
                "handler with id \"nope\" not found"
            ))
        );
    }

    #[tokio::test]
    async fn oversized_response_becomes_an_error_response() {
        let (local, mut host) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let settings = WorkerSettings {
            pid: 4242,
            frame: FrameConfig {
                max_payload_size: 300,
            },
            ..WorkerSettings::default()
        };
        let worker = Worker::new(
            Endpoints::from_io(reader, writer),
            Arc::new(LoopbackEngine::new()),
            settings,
        );
        let run = tokio::spawn(async move { worker.run().await });

        for n in 0..20u32 {
            let request = Request::new(n, "createHandler")
                .with_internal(Internal::handler(format!("handler-{n}")));
            send(&mut host, request).await;
        }
        send(&mut host, Request::new(100u32, "dump")).await;
        let close = Request::new(101u32, "handler.close").with_internal(Internal::handler("handler-0"));
        send(&mut host, close).await;
        host.shutdown().await.unwrap();
        let mut wire = Vec::new();
        host.read_to_end(&mut wire).await.unwrap();
        run.await.unwrap().unwrap();

        let responses: Vec<Response> = decode_all(&wire)
            .into_iter()
            .filter_map(|message| match message {
                Message::Response(response) => Some(response),
                _ => None,
            })
            .collect();
        assert_eq!(responses.len(), 22);
        let Response::Rejected { id, kind, reason } = &responses[20] else {
            panic!("expected dump to be rejected, got {:?}", responses[20]);
        };
        assert_eq!(*id, Id::from(100u32));
        assert_eq!(*kind, ErrorKind::Generic);
        assert!(reason.contains("too large"), "{reason}");
        assert_eq!(responses[21], Response::accepted(101u32.into(), None));
    }

    #[tokio::test]
    async fn rtp_capabilities_use_a_throwaway_connection() {
        let (worker, engine, _host) = worker();

        let sdp = worker.rtp_capabilities().await.unwrap();
        let sdp = sdp.as_str().unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("a=sendonly"));
        assert_eq!(engine.connections_created(), 1);
        assert_eq!(engine.connections_closed(), 1);
    }

    #[tokio::test]
    async fn stop_token_ends_the_loop() {
        let (worker, _engine, _host) = worker();
        let token = worker.shutdown_token();
        token.cancel();

        worker.run().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (worker, engine, _host) = worker();
        worker
            .create_handler("h1".into(), None)
            .await
            .unwrap();

        worker.shutdown().await;
        worker.shutdown().await;
        assert_eq!(engine.connection_close_calls(), 1);
        assert!(worker.handlers.is_empty());
    }
}
