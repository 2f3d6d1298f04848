use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// One signaling frame. Every frame carries the sender's session id (`mid`)
/// and the room id (`rid`); `target` narrows delivery to a single peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMessage {
    pub mid: String,
    pub rid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub body: SignalBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SignalBody {
    #[serde(rename = "enter")]
    Enter {
        #[serde(rename = "userInfo", default)]
        user_info: Value,
    },
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "userInfo", default)]
        user_info: Value,
    },
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "candidate")]
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            rename = "sdpMLineIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sdp_mline_index: Option<u16>,
    },
    #[serde(rename = "restart")]
    Restart,
    #[serde(rename = "bye")]
    Bye,
    #[serde(rename = "updateUserEvent")]
    UserDataUpdate {
        #[serde(rename = "userData")]
        user_data: Value,
    },
    #[serde(rename = "muteEvent")]
    MuteEvent { kind: MediaKind, muted: bool },
    #[serde(rename = "roomLockEvent")]
    RoomLockEvent { lock: bool },
    #[serde(rename = "stream")]
    Stream { status: String },
    #[serde(rename = "public")]
    PublicMessage { data: Value },
    #[serde(rename = "group")]
    Group { lists: Vec<SignalMessage> },
}

const KNOWN_TYPES: [&str; 13] = [
    "enter",
    "welcome",
    "offer",
    "answer",
    "candidate",
    "restart",
    "bye",
    "updateUserEvent",
    "muteEvent",
    "roomLockEvent",
    "stream",
    "public",
    "group",
];

impl SignalBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalBody::Enter { .. } => "enter",
            SignalBody::Welcome { .. } => "welcome",
            SignalBody::Offer { .. } => "offer",
            SignalBody::Answer { .. } => "answer",
            SignalBody::Candidate { .. } => "candidate",
            SignalBody::Restart => "restart",
            SignalBody::Bye => "bye",
            SignalBody::UserDataUpdate { .. } => "updateUserEvent",
            SignalBody::MuteEvent { .. } => "muteEvent",
            SignalBody::RoomLockEvent { .. } => "roomLockEvent",
            SignalBody::Stream { .. } => "stream",
            SignalBody::PublicMessage { .. } => "public",
            SignalBody::Group { .. } => "group",
        }
    }

    /// Types that can arrive in floods and therefore go through the
    /// outbound batching queue instead of straight to the socket.
    pub fn is_must_queue(&self) -> bool {
        matches!(
            self,
            SignalBody::Stream { .. }
                | SignalBody::UserDataUpdate { .. }
                | SignalBody::MuteEvent { .. }
                | SignalBody::RoomLockEvent { .. }
                | SignalBody::PublicMessage { .. }
        )
    }
}

impl SignalMessage {
    pub fn new(mid: impl Into<String>, rid: impl Into<String>, body: SignalBody) -> Self {
        Self {
            mid: mid.into(),
            rid: rid.into(),
            target: None,
            body,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Wraps queued messages into a single envelope addressed with the
    /// `mid`/`rid` of the first one. Returns `None` for an empty batch.
    pub fn group(lists: Vec<SignalMessage>) -> Option<Self> {
        let first = lists.first()?;
        let (mid, rid) = (first.mid.clone(), first.rid.clone());
        Some(Self::new(mid, rid, SignalBody::Group { lists }))
    }

    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }

    pub fn is_must_queue(&self) -> bool {
        self.body.is_must_queue()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(DecodeError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|err| DecodeError::Malformed(err.to_string()))
    }

    /// Flattens group envelopes into the messages they carry, in order.
    pub fn into_flat(self) -> Vec<SignalMessage> {
        match self.body {
            SignalBody::Group { lists } => lists.into_iter().flat_map(Self::into_flat).collect(),
            _ => vec![self],
        }
    }
}
