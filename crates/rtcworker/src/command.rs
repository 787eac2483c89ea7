//! Typed commands decoded from inbound messages.
//!
//! Method and event names are resolved once through [`CommandTable`]; payloads
//! are decoded into per-command structs with required fields checked up front,
//! so the dispatcher never pokes at free-form JSON.

use std::collections::{BTreeMap, HashMap};

use rtcworker_channel::{Internal, Notification, Request};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::engine::{
    DataChannelInit, Direction, MediaKind, RtcConfiguration, SdpType, SessionDescription,
    SourceDescriptor, SourceKind,
};
use crate::error::{Result, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetRtpCapabilities,
    Dump,
    CreatePlayer,
    CreateHandler,
    PlayerClose,
    HandlerClose,
    HandlerGetLocalDescription,
    HandlerCreateOffer,
    HandlerCreateAnswer,
    HandlerSetLocalDescription,
    HandlerSetRemoteDescription,
    HandlerGetMid,
    HandlerAddTrack,
    HandlerRemoveTrack,
    HandlerReplaceTrack,
    HandlerSetTrackDirection,
    HandlerGetTransportStats,
    HandlerGetSenderStats,
    HandlerGetReceiverStats,
    HandlerCreateDataChannel,
}

impl Method {
    pub const ALL: [Method; 20] = [
        Method::GetRtpCapabilities,
        Method::Dump,
        Method::CreatePlayer,
        Method::CreateHandler,
        Method::PlayerClose,
        Method::HandlerClose,
        Method::HandlerGetLocalDescription,
        Method::HandlerCreateOffer,
        Method::HandlerCreateAnswer,
        Method::HandlerSetLocalDescription,
        Method::HandlerSetRemoteDescription,
        Method::HandlerGetMid,
        Method::HandlerAddTrack,
        Method::HandlerRemoveTrack,
        Method::HandlerReplaceTrack,
        Method::HandlerSetTrackDirection,
        Method::HandlerGetTransportStats,
        Method::HandlerGetSenderStats,
        Method::HandlerGetReceiverStats,
        Method::HandlerCreateDataChannel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::GetRtpCapabilities => "getRtpCapabilities",
            Method::Dump => "dump",
            Method::CreatePlayer => "createPlayer",
            Method::CreateHandler => "createHandler",
            Method::PlayerClose => "player.close",
            Method::HandlerClose => "handler.close",
            Method::HandlerGetLocalDescription => "handler.getLocalDescription",
            Method::HandlerCreateOffer => "handler.createOffer",
            Method::HandlerCreateAnswer => "handler.createAnswer",
            Method::HandlerSetLocalDescription => "handler.setLocalDescription",
            Method::HandlerSetRemoteDescription => "handler.setRemoteDescription",
            Method::HandlerGetMid => "handler.getMid",
            Method::HandlerAddTrack => "handler.addTrack",
            Method::HandlerRemoveTrack => "handler.removeTrack",
            Method::HandlerReplaceTrack => "handler.replaceTrack",
            Method::HandlerSetTrackDirection => "handler.setTrackDirection",
            Method::HandlerGetTransportStats => "handler.getTransportStats",
            Method::HandlerGetSenderStats => "handler.getSenderStats",
            Method::HandlerGetReceiverStats => "handler.getReceiverStats",
            Method::HandlerCreateDataChannel => "handler.createDataChannel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    HandlerClose,
    HandlerEnableTrack,
    HandlerDisableTrack,
    DataChannelSend,
    DataChannelSendBinary,
    DataChannelClose,
    DataChannelSetBufferedAmountLowThreshold,
    PlayerClose,
    PlayerStopTrack,
}

impl Event {
    pub const ALL: [Event; 9] = [
        Event::HandlerClose,
        Event::HandlerEnableTrack,
        Event::HandlerDisableTrack,
        Event::DataChannelSend,
        Event::DataChannelSendBinary,
        Event::DataChannelClose,
        Event::DataChannelSetBufferedAmountLowThreshold,
        Event::PlayerClose,
        Event::PlayerStopTrack,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Event::HandlerClose => "handler.close",
            Event::HandlerEnableTrack => "handler.enableTrack",
            Event::HandlerDisableTrack => "handler.disableTrack",
            Event::DataChannelSend => "datachannel.send",
            Event::DataChannelSendBinary => "datachannel.sendBinary",
            Event::DataChannelClose => "datachannel.close",
            Event::DataChannelSetBufferedAmountLowThreshold => {
                "datachannel.setBufferedAmountLowThreshold"
            }
            Event::PlayerClose => "player.close",
            Event::PlayerStopTrack => "player.stopTrack",
        }
    }
}

/// Where a track to send comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackRef {
    /// A track of a local player.
    Player(String),
    /// A track received on some connection.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachTrack {
    pub local_id: String,
    pub kind: MediaKind,
    pub source: TrackRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestCommand {
    GetRtpCapabilities,
    Dump,
    CreatePlayer {
        player_id: String,
        source: SourceDescriptor,
    },
    CreateHandler {
        handler_id: String,
        rtc_configuration: Option<RtcConfiguration>,
    },
    ClosePlayer {
        player_id: String,
    },
    Handler {
        handler_id: String,
        request: HandlerRequest,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerRequest {
    Close,
    GetLocalDescription,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    GetMid { local_id: String },
    AddTrack(AttachTrack),
    RemoveTrack { local_id: String },
    ReplaceTrack(AttachTrack),
    SetTrackDirection { local_id: String, direction: Direction },
    GetTransportStats,
    GetSenderStats { mid: String },
    GetReceiverStats { mid: String },
    CreateDataChannel { data_channel_id: String, init: DataChannelInit },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationCommand {
    ClosePlayer {
        player_id: String,
    },
    StopPlayerTrack {
        player_id: String,
        kind: MediaKind,
    },
    Handler {
        handler_id: String,
        notification: HandlerNotification,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerNotification {
    Close,
    EnableTrack,
    DisableTrack,
    SendText { data_channel_id: String, text: String },
    SendBinary { data_channel_id: String, bytes: Vec<u8> },
    CloseDataChannel { data_channel_id: String },
    SetBufferedAmountLowThreshold { data_channel_id: String, threshold: usize },
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LocalIdData {
    local_id: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TrackData {
    local_id: Option<String>,
    kind: Option<MediaKind>,
    player_id: Option<String>,
    recv_track_id: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DirectionData {
    local_id: Option<String>,
    direction: Option<Direction>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct MidData {
    mid: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct DescriptionData {
    #[serde(rename = "type")]
    kind: Option<SdpType>,
    sdp: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateHandlerData {
    rtc_configuration: Option<RtcConfiguration>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct PlayerData {
    source: Option<SourceKind>,
    file: Option<String>,
    format: Option<String>,
    options: Option<BTreeMap<String, Value>>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct KindData {
    kind: Option<MediaKind>,
}

/// Name-to-command mapping, built once per worker.
#[derive(Debug)]
pub struct CommandTable {
    methods: HashMap<&'static str, Method>,
    events: HashMap<&'static str, Event>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            methods: Method::ALL
                .iter()
                .map(|method| (method.name(), *method))
                .collect(),
            events: Event::ALL.iter().map(|event| (event.name(), *event)).collect(),
        }
    }

    pub fn method(&self, name: &str) -> Option<Method> {
        self.methods.get(name).copied()
    }

    pub fn event(&self, name: &str) -> Option<Event> {
        self.events.get(name).copied()
    }

    pub fn decode_request(&self, request: &Request) -> Result<RequestCommand> {
        let method = self
            .method(&request.method)
            .ok_or_else(|| WorkerError::UnknownMethod(request.method.clone()))?;
        let internal = routing(request.internal.as_ref())?;
        let internal = internal.as_ref();
        let data = request.data.as_ref();

        let command = match method {
            Method::GetRtpCapabilities => RequestCommand::GetRtpCapabilities,
            Method::Dump => RequestCommand::Dump,
            Method::CreatePlayer => RequestCommand::CreatePlayer {
                player_id: player_id(internal)?,
                source: source_descriptor(data)?,
            },
            Method::CreateHandler => {
                let handler_id = handler_id(internal)?;
                let payload: CreateHandlerData = parse(data)?;
                if let Some(configuration) = &payload.rtc_configuration {
                    configuration.validate().map_err(WorkerError::Validation)?;
                }
                RequestCommand::CreateHandler {
                    handler_id,
                    rtc_configuration: payload.rtc_configuration,
                }
            }
            Method::PlayerClose => RequestCommand::ClosePlayer {
                player_id: player_id(internal)?,
            },
            handler_method => RequestCommand::Handler {
                handler_id: handler_id(internal)?,
                request: handler_request(handler_method, internal, data)?,
            },
        };
        Ok(command)
    }

    pub fn decode_notification(&self, notification: &Notification) -> Result<NotificationCommand> {
        let event = self
            .event(&notification.event)
            .ok_or_else(|| WorkerError::UnknownEvent(notification.event.clone()))?;
        let internal = routing(notification.internal.as_ref())?;
        let internal = internal.as_ref();
        let data = notification.data.as_ref();

        let command = match event {
            Event::PlayerClose => NotificationCommand::ClosePlayer {
                player_id: player_id(internal)?,
            },
            Event::PlayerStopTrack => {
                let player_id = player_id(internal)?;
                let payload: KindData = parse(data)?;
                NotificationCommand::StopPlayerTrack {
                    player_id,
                    kind: require(payload.kind, "data.kind")?,
                }
            }
            handler_event => NotificationCommand::Handler {
                handler_id: handler_id(internal)?,
                notification: handler_notification(handler_event, internal, data)?,
            },
        };
        Ok(command)
    }
}

fn handler_request(
    method: Method,
    internal: Option<&Internal>,
    data: Option<&Value>,
) -> Result<HandlerRequest> {
    let request = match method {
        Method::HandlerClose => HandlerRequest::Close,
        Method::HandlerGetLocalDescription => HandlerRequest::GetLocalDescription,
        Method::HandlerCreateOffer => HandlerRequest::CreateOffer,
        Method::HandlerCreateAnswer => HandlerRequest::CreateAnswer,
        Method::HandlerSetLocalDescription => {
            HandlerRequest::SetLocalDescription(session_description(data)?)
        }
        Method::HandlerSetRemoteDescription => {
            HandlerRequest::SetRemoteDescription(session_description(data)?)
        }
        Method::HandlerGetMid => HandlerRequest::GetMid {
            local_id: local_id(data)?,
        },
        Method::HandlerAddTrack => HandlerRequest::AddTrack(attach_track(data)?),
        Method::HandlerRemoveTrack => HandlerRequest::RemoveTrack {
            local_id: local_id(data)?,
        },
        Method::HandlerReplaceTrack => HandlerRequest::ReplaceTrack(attach_track(data)?),
        Method::HandlerSetTrackDirection => {
            let payload: DirectionData = parse(data)?;
            HandlerRequest::SetTrackDirection {
                local_id: require(payload.local_id, "data.localId")?,
                direction: require(payload.direction, "data.direction")?,
            }
        }
        Method::HandlerGetTransportStats => HandlerRequest::GetTransportStats,
        Method::HandlerGetSenderStats => HandlerRequest::GetSenderStats { mid: mid(data)? },
        Method::HandlerGetReceiverStats => HandlerRequest::GetReceiverStats { mid: mid(data)? },
        Method::HandlerCreateDataChannel => HandlerRequest::CreateDataChannel {
            data_channel_id: data_channel_id(internal)?,
            init: parse(data)?,
        },
        other => return Err(WorkerError::UnknownMethod(other.name().to_string())),
    };
    Ok(request)
}

fn handler_notification(
    event: Event,
    internal: Option<&Internal>,
    data: Option<&Value>,
) -> Result<HandlerNotification> {
    let notification = match event {
        Event::HandlerClose => HandlerNotification::Close,
        Event::HandlerEnableTrack => HandlerNotification::EnableTrack,
        Event::HandlerDisableTrack => HandlerNotification::DisableTrack,
        Event::DataChannelSend => HandlerNotification::SendText {
            data_channel_id: data_channel_id(internal)?,
            text: string_data(data)?.to_string(),
        },
        Event::DataChannelSendBinary => {
            let data_channel_id = data_channel_id(internal)?;
            let bytes = base64::decode(string_data(data)?)
                .map_err(|err| WorkerError::validation(format!("invalid base64 data: {err}")))?;
            HandlerNotification::SendBinary {
                data_channel_id,
                bytes,
            }
        }
        Event::DataChannelClose => HandlerNotification::CloseDataChannel {
            data_channel_id: data_channel_id(internal)?,
        },
        Event::DataChannelSetBufferedAmountLowThreshold => {
            let data_channel_id = data_channel_id(internal)?;
            let threshold = require(data, "data")?
                .as_u64()
                .and_then(|value| usize::try_from(value).ok())
                .ok_or_else(|| WorkerError::validation("data must be a non-negative integer"))?;
            HandlerNotification::SetBufferedAmountLowThreshold {
                data_channel_id,
                threshold,
            }
        }
        other => return Err(WorkerError::UnknownEvent(other.name().to_string())),
    };
    Ok(notification)
}

/// Absent data decodes as an empty payload so missing fields are named individually.
fn parse<T: DeserializeOwned + Default>(data: Option<&Value>) -> Result<T> {
    match data {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| WorkerError::validation(format!("invalid data: {err}"))),
    }
}

fn routing(internal: Option<&Value>) -> Result<Option<Internal>> {
    internal
        .map(Internal::from_value)
        .transpose()
        .map_err(|err| WorkerError::validation(format!("invalid internal: {err}")))
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| WorkerError::validation(format!("missing {field}")))
}

fn handler_id(internal: Option<&Internal>) -> Result<String> {
    require(
        internal.and_then(|internal| internal.handler_id.clone()),
        "internal.handlerId",
    )
}

fn player_id(internal: Option<&Internal>) -> Result<String> {
    require(
        internal.and_then(|internal| internal.player_id.clone()),
        "internal.playerId",
    )
}

fn data_channel_id(internal: Option<&Internal>) -> Result<String> {
    require(
        internal.and_then(|internal| internal.data_channel_id.clone()),
        "internal.dataChannelId",
    )
}

fn local_id(data: Option<&Value>) -> Result<String> {
    let payload: LocalIdData = parse(data)?;
    require(payload.local_id, "data.localId")
}

fn mid(data: Option<&Value>) -> Result<String> {
    let payload: MidData = parse(data)?;
    require(payload.mid, "data.mid")
}

fn string_data(data: Option<&Value>) -> Result<&str> {
    require(data, "data")?
        .as_str()
        .ok_or_else(|| WorkerError::validation("data must be a string"))
}

fn session_description(data: Option<&Value>) -> Result<SessionDescription> {
    let payload: DescriptionData = parse(data)?;
    Ok(SessionDescription {
        kind: require(payload.kind, "data.type")?,
        sdp: require(payload.sdp, "data.sdp")?,
    })
}

fn attach_track(data: Option<&Value>) -> Result<AttachTrack> {
    let payload: TrackData = parse(data)?;
    let local_id = require(payload.local_id, "data.localId")?;
    let kind = require(payload.kind, "data.kind")?;
    let source = match (payload.player_id, payload.recv_track_id) {
        (Some(player_id), _) => TrackRef::Player(player_id),
        (None, Some(track_id)) => TrackRef::Remote(track_id),
        (None, None) => {
            return Err(WorkerError::validation(
                "missing data.playerId or data.recvTrackId",
            ))
        }
    };
    Ok(AttachTrack {
        local_id,
        kind,
        source,
    })
}

fn source_descriptor(data: Option<&Value>) -> Result<SourceDescriptor> {
    let payload: PlayerData = parse(data)?;
    Ok(SourceDescriptor {
        kind: require(payload.source, "data.source")?,
        file: require(payload.file, "data.file")?,
        format: payload.format,
        options: payload.options.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use rtcworker_channel::ErrorKind;
    use serde_json::json;

    use super::*;

    fn request(method: &str, internal: Option<Internal>, data: Option<Value>) -> Request {
        Request {
            id: 1u32.into(),
            method: method.into(),
            internal: internal.map(Value::from),
            data,
        }
    }

    fn notification(event: &str, internal: Option<Internal>, data: Option<Value>) -> Notification {
        Notification {
            event: event.into(),
            target_id: None,
            internal: internal.map(Value::from),
            data,
        }
    }

    #[test]
    fn every_name_resolves_to_itself() {
        let table = CommandTable::new();
        for method in Method::ALL {
            assert_eq!(table.method(method.name()), Some(method));
        }
        for event in Event::ALL {
            assert_eq!(table.event(event.name()), Some(event));
        }
    }

    #[test]
    fn unknown_method_is_a_type_error() {
        let err = CommandTable::new()
            .decode_request(&request("handler.fly", None, None))
            .unwrap_err();
        assert!(matches!(&err, WorkerError::UnknownMethod(name) if name == "handler.fly"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn mistyped_internal_is_a_type_error() {
        let table = CommandTable::new();
        for internal in [json!({ "handlerId": 5 }), json!("h1")] {
            let request = Request {
                id: 1u32.into(),
                method: "handler.createOffer".into(),
                internal: Some(internal.clone()),
                data: None,
            };
            let err = table.decode_request(&request).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert!(err.to_string().starts_with("invalid internal"), "{err}");
        }
    }

    #[test]
    fn handler_methods_require_handler_id() {
        let err = CommandTable::new()
            .decode_request(&request("handler.createOffer", None, None))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing internal.handlerId");
    }

    #[test]
    fn decodes_add_track_from_player() {
        let command = CommandTable::new()
            .decode_request(&request(
                "handler.addTrack",
                Some(Internal::handler("h1")),
                Some(json!({ "localId": "a1", "kind": "audio", "playerId": "p1" })),
            ))
            .unwrap();

        assert_eq!(
            command,
            RequestCommand::Handler {
                handler_id: "h1".into(),
                request: HandlerRequest::AddTrack(AttachTrack {
                    local_id: "a1".into(),
                    kind: MediaKind::Audio,
                    source: TrackRef::Player("p1".into()),
                }),
            }
        );
    }

    #[test]
    fn add_track_needs_a_source() {
        let err = CommandTable::new()
            .decode_request(&request(
                "handler.addTrack",
                Some(Internal::handler("h1")),
                Some(json!({ "localId": "a1", "kind": "video" })),
            ))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing data.playerId or data.recvTrackId");
    }

    #[test]
    fn get_mid_without_data_names_the_field() {
        let err = CommandTable::new()
            .decode_request(&request("handler.getMid", Some(Internal::handler("h1")), None))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing data.localId");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn description_type_is_checked() {
        let table = CommandTable::new();
        let err = table
            .decode_request(&request(
                "handler.setRemoteDescription",
                Some(Internal::handler("h1")),
                Some(json!({ "type": "bogus", "sdp": "v=0" })),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let command = table
            .decode_request(&request(
                "handler.setRemoteDescription",
                Some(Internal::handler("h1")),
                Some(json!({ "type": "offer", "sdp": "v=0" })),
            ))
            .unwrap();
        assert!(matches!(
            command,
            RequestCommand::Handler {
                request: HandlerRequest::SetRemoteDescription(SessionDescription {
                    kind: SdpType::Offer,
                    ..
                }),
                ..
            }
        ));
    }

    #[test]
    fn create_handler_validates_configuration() {
        let err = CommandTable::new()
            .decode_request(&request(
                "createHandler",
                Some(Internal::handler("h1")),
                Some(json!({ "rtcConfiguration": { "iceServers": [{ "urls": [] }] } })),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn create_player_requires_source_and_file() {
        let table = CommandTable::new();
        let err = table
            .decode_request(&request(
                "createPlayer",
                Some(Internal::player("p1")),
                Some(json!({ "source": "file" })),
            ))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing data.file");

        let command = table
            .decode_request(&request(
                "createPlayer",
                Some(Internal::player("p1")),
                Some(json!({ "source": "device", "file": "hw:0", "format": "alsa" })),
            ))
            .unwrap();
        assert!(matches!(
            command,
            RequestCommand::CreatePlayer { ref player_id, ref source }
                if player_id == "p1" && source.kind == SourceKind::Device
        ));
    }

    #[test]
    fn send_binary_decodes_base64() {
        let internal = Internal {
            handler_id: Some("h1".into()),
            data_channel_id: Some("d1".into()),
            ..Internal::default()
        };
        let command = CommandTable::new()
            .decode_notification(&notification(
                "datachannel.sendBinary",
                Some(internal),
                Some(json!("AQID")),
            ))
            .unwrap();

        assert_eq!(
            command,
            NotificationCommand::Handler {
                handler_id: "h1".into(),
                notification: HandlerNotification::SendBinary {
                    data_channel_id: "d1".into(),
                    bytes: vec![1, 2, 3],
                },
            }
        );
    }

    #[test]
    fn datachannel_events_require_data_channel_id() {
        let err = CommandTable::new()
            .decode_notification(&notification(
                "datachannel.send",
                Some(Internal::handler("h1")),
                Some(json!("hi")),
            ))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing internal.dataChannelId");
    }

    #[test]
    fn threshold_must_be_numeric() {
        let internal = Internal {
            handler_id: Some("h1".into()),
            data_channel_id: Some("d1".into()),
            ..Internal::default()
        };
        let err = CommandTable::new()
            .decode_notification(&notification(
                "datachannel.setBufferedAmountLowThreshold",
                Some(internal),
                Some(json!("lots")),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn stop_track_requires_kind() {
        let command = CommandTable::new()
            .decode_notification(&notification(
                "player.stopTrack",
                Some(Internal::player("p1")),
                Some(json!({ "kind": "video" })),
            ))
            .unwrap();
        assert_eq!(
            command,
            NotificationCommand::StopPlayerTrack {
                player_id: "p1".into(),
                kind: MediaKind::Video,
            }
        );
    }
}
