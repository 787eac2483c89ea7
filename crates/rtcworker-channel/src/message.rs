use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Request identifier chosen by the host. Opaque; echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(number) => write!(f, "{number}"),
            Id::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Text(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Text(value)
    }
}

impl From<u32> for Id {
    fn from(value: u32) -> Self {
        Id::Number(value.into())
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Number(value.into())
    }
}

/// Routing identifiers. Used to select the target entity, never as application data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_channel_id: Option<String>,
}

impl Internal {
    pub fn handler(id: impl Into<String>) -> Self {
        Self {
            handler_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn player(id: impl Into<String>) -> Self {
        Self {
            player_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Read routing ids out of a message's raw `internal` field.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Self::deserialize(value)
    }
}

impl From<Internal> for Value {
    fn from(internal: Internal) -> Self {
        let mut fields = serde_json::Map::new();
        let ids = [
            ("handlerId", internal.handler_id),
            ("playerId", internal.player_id),
            ("dataChannelId", internal.data_channel_id),
        ];
        for (key, id) in ids {
            if let Some(id) = id {
                fields.insert(key.to_string(), Value::String(id));
            }
        }
        Value::Object(fields)
    }
}

/// Host-to-worker call expecting exactly one [`Response`].
///
/// `internal` is kept as raw JSON so that a malformed routing field can still be
/// answered; [`Internal::from_value`] reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub internal: Option<Value>,
    pub data: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<Id>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            internal: None,
            data: None,
        }
    }

    pub fn with_internal(mut self, internal: Internal) -> Self {
        self.internal = Some(internal.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Coarse error category reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid arguments or state. Wire tag `TypeError`.
    Validation,
    /// Anything else. Wire tag `Error`.
    Generic,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "TypeError",
            ErrorKind::Generic => "Error",
        }
    }

    fn from_wire(tag: &str) -> Self {
        match tag {
            "TypeError" => ErrorKind::Validation,
            _ => ErrorKind::Generic,
        }
    }
}

/// Outcome of a [`Request`], correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Accepted {
        id: Id,
        data: Option<Value>,
    },
    Rejected {
        id: Id,
        kind: ErrorKind,
        reason: String,
    },
}

impl Response {
    pub fn accepted(id: Id, data: Option<Value>) -> Self {
        Response::Accepted { id, data }
    }

    pub fn rejected(id: Id, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Response::Rejected {
            id,
            kind,
            reason: reason.into(),
        }
    }

    pub fn id(&self) -> &Id {
        match self {
            Response::Accepted { id, .. } | Response::Rejected { id, .. } => id,
        }
    }
}

/// One-way message in either direction.
///
/// Worker-originated notifications address an entity through `target_id`;
/// host-originated ones route through `internal`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event: String,
    pub target_id: Option<Id>,
    pub internal: Option<Value>,
    pub data: Option<Value>,
}

impl Notification {
    /// Notification emitted by the worker about `target_id`.
    pub fn targeted(target_id: impl Into<Id>, event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            target_id: Some(target_id.into()),
            internal: None,
            data,
        }
    }

    /// Notification sent by the host, routed through `internal`.
    pub fn routed(event: impl Into<String>, internal: Internal, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            target_id: None,
            internal: Some(internal.into()),
            data,
        }
    }
}

/// Any message carried by one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Flat wire shape shared by all messages; classification happens in [`Message::decode`].
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    internal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Message {
    /// Decode one frame payload.
    ///
    /// `data: null` is treated as an absent payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_slice(payload)?;

        match (raw.method, raw.event) {
            (Some(_), Some(_)) => Err(ProtocolError::Ambiguous),
            (Some(method), None) => {
                let id = raw.id.ok_or(ProtocolError::MissingField("id"))?;
                Ok(Message::Request(Request {
                    id,
                    method,
                    internal: raw.internal,
                    data: raw.data,
                }))
            }
            (None, Some(event)) => Ok(Message::Notification(Notification {
                event,
                target_id: raw.target_id,
                internal: raw.internal,
                data: raw.data,
            })),
            (None, None) => match (raw.id, raw.accepted, raw.error) {
                (Some(id), _, Some(error)) => Ok(Message::Response(Response::Rejected {
                    id,
                    kind: ErrorKind::from_wire(&error),
                    reason: raw.reason.unwrap_or_default(),
                })),
                (Some(id), Some(true), None) => Ok(Message::Response(Response::Accepted {
                    id,
                    data: raw.data,
                })),
                _ => Err(ProtocolError::MissingDiscriminant),
            },
        }
    }

    /// Encode as a JSON frame payload.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.to_raw())
    }

    fn to_raw(&self) -> RawMessage {
        match self.clone() {
            Message::Request(request) => RawMessage {
                id: Some(request.id),
                method: Some(request.method),
                internal: request.internal,
                data: request.data,
                ..RawMessage::default()
            },
            Message::Response(Response::Accepted { id, data }) => RawMessage {
                id: Some(id),
                accepted: Some(true),
                data,
                ..RawMessage::default()
            },
            Message::Response(Response::Rejected { id, kind, reason }) => RawMessage {
                id: Some(id),
                error: Some(kind.as_str().to_string()),
                reason: Some(reason),
                ..RawMessage::default()
            },
            Message::Notification(notification) => RawMessage {
                target_id: notification.target_id,
                event: Some(notification.event),
                internal: notification.internal,
                data: notification.data,
                ..RawMessage::default()
            },
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}
