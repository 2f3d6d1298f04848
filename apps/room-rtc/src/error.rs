use thiserror::Error;

use crate::peer::ConnectionState;
use crate::signaling::TransportKind;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("signaling transport is dead; recreate it to retry")]
    Dead,
    #[error("a connection attempt is already in progress")]
    ReconnectInProgress,
    #[error("connect via {kind:?} to {target} failed: {reason}")]
    Connect {
        kind: TransportKind,
        target: String,
        reason: String,
    },
    #[error("connect via {kind:?} to {target} timed out")]
    Timeout { kind: TransportKind, target: String },
    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid json or does not match its type: {0}")]
    Malformed(String),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown frame type {0}")]
    UnknownType(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    #[error("peer connection rejected the operation: {0}")]
    Rejected(String),
    #[error("peer connection is closed")]
    Closed,
}

impl From<webrtc::Error> for PrimitiveError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrConnectionClosed => PrimitiveError::Closed,
            other => PrimitiveError::Rejected(other.to_string()),
        }
    }
}

/// Stage of a negotiation round at which the primitive reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    CreateDataChannel,
    AttachStream,
    Connect,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("a negotiation round is already in flight (state {0:?})")]
    RoundInFlight(ConnectionState),
    #[error("cannot {op} while session is {state:?}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },
    #[error("{stage:?} failed: {source}")]
    Primitive {
        stage: NegotiationStage,
        #[source]
        source: PrimitiveError,
    },
    #[error("session has no peer connection; call connect first")]
    NotStarted,
    #[error("session is closed")]
    Closed,
    #[error("signaling send failed: {0}")]
    Send(String),
    #[error("no data channel labelled {0}")]
    UnknownChannel(String),
}

impl NegotiationError {
    pub fn primitive(stage: NegotiationStage, source: PrimitiveError) -> Self {
        NegotiationError::Primitive { stage, source }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
