//! Per-peer negotiation: one [`PeerSession`] per remote participant drives
//! description exchange, candidate buffering and channel/stream attachment
//! on top of a [`PeerConnection`] primitive.

use serde::{Deserialize, Serialize};

use crate::protocol::MediaKind;

mod connection;
pub mod rtc;
mod session;

pub use connection::{DataChannel, PeerConnection, PeerConnectionFactory, PrimitiveEvent};
pub use session::{PeerSession, PeerSessionHandle, SessionContext, SessionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// A round is in flight until it reaches `connected`, `failed` or is superseded.
    pub fn round_in_flight(self) -> bool {
        matches!(self, ConnectionState::Offering | ConnectionState::Answering)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveLocalAnswer,
    HaveRemoteOffer,
    HaveRemoteAnswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Local media handed to a session for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundStream {
    pub stream_id: String,
    pub tracks: Vec<TrackInfo>,
}

/// Label of the session's singleton chat channel.
pub const MAIN_CHANNEL: &str = "main";

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalOffer(Result<(), String>),
    LocalAnswer(Result<(), String>),
    LocalDescription(Result<SdpType, String>),
    RemoteDescription(Result<SdpType, String>),
    SignalingState(SignalingState),
    IceConnectionState(IceConnectionState),
    ConnectionState(ConnectionState),
    DataChannel { label: String, main: bool },
    StreamAttached { stream_id: String, replaced: bool },
    Failed { error: String },
    Discarded {
        message_type: &'static str,
        reason: String,
    },
}

impl PeerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::LocalOffer(Ok(())) => "peer:local_offer:success",
            PeerEvent::LocalOffer(Err(_)) => "peer:local_offer:failure",
            PeerEvent::LocalAnswer(Ok(())) => "peer:local_answer:success",
            PeerEvent::LocalAnswer(Err(_)) => "peer:local_answer:failure",
            PeerEvent::LocalDescription(Ok(_)) => "peer:local_description:success",
            PeerEvent::LocalDescription(Err(_)) => "peer:local_description:error",
            PeerEvent::RemoteDescription(Ok(_)) => "peer:remote_description:success",
            PeerEvent::RemoteDescription(Err(_)) => "peer:remote_description:error",
            PeerEvent::SignalingState(_) => "peer:signalingstate",
            PeerEvent::IceConnectionState(_) => "peer:iceconnectionstate",
            PeerEvent::ConnectionState(_) => "peer:connectionstate",
            PeerEvent::DataChannel { .. } => "peer:datachannel",
            PeerEvent::StreamAttached { .. } => "peer:stream",
            PeerEvent::Failed { .. } => "peer:failed",
            PeerEvent::Discarded { .. } => "peer:discarded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub peer_id: String,
    pub event: PeerEvent,
}
