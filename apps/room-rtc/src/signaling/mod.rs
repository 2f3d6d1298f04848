//! Delivery of negotiation messages to the relay over one shared connection:
//! port/transport fallback on connect failure and batching of flood-prone
//! message types under a fixed flush interval.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SignalingError;
use crate::protocol::SignalMessage;

mod batch;
mod connector;
mod cursor;
mod polling;
mod transport;
mod websocket;

pub use batch::{OutboundBatcher, Submit};
pub use connector::{ConnectTarget, ConnectionIo, Connector, DefaultConnector, InboundFrame};
pub use cursor::{Advance, PortCursor};
pub use polling::PollingConnector;
pub use transport::SignalingTransport;
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent bidirectional socket.
    Primary,
    /// Polling-based equivalent used once every primary port failed.
    Fallback,
}

/// Numeric codes carried by `TransportEvent::ConnectError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorCode {
    InitialConnect,
    ReconnectFailed,
    Exhausted,
    ReconnectInProgress,
}

impl ConnectErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ConnectErrorCode::InitialConnect => 0,
            ConnectErrorCode::ReconnectFailed => -1,
            ConnectErrorCode::Exhausted => -3,
            ConnectErrorCode::ReconnectInProgress => -4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect {
        kind: TransportKind,
        target: String,
    },
    Disconnect {
        requested: bool,
    },
    Error(String),
    Message(SignalMessage),
    ConnectError {
        code: ConnectErrorCode,
        error: String,
        kind: TransportKind,
    },
    ConnectRetry {
        kind: TransportKind,
        attempt: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub host: String,
    pub path: String,
    pub secure: bool,
    pub secure_ports: Vec<u16>,
    pub insecure_ports: Vec<u16>,
}

impl SignalingEndpoint {
    /// Candidate ports of the scheme in use, in connection order.
    pub fn ports(&self) -> &[u16] {
        if self.secure {
            &self.secure_ports
        } else {
            &self.insecure_ports
        }
    }

    pub fn target(&self, kind: TransportKind, port: u16) -> Result<ConnectTarget, SignalingError> {
        let scheme = match (kind, self.secure) {
            (TransportKind::Primary, true) => "wss",
            (TransportKind::Primary, false) => "ws",
            (TransportKind::Fallback, true) => "https",
            (TransportKind::Fallback, false) => "http",
        };
        let path = self.path.trim_matches('/');
        let raw = format!("{scheme}://{}:{port}/{path}", self.host);
        let url = Url::parse(&raw)
            .map_err(|err| SignalingError::InvalidEndpoint(format!("{raw}: {err}")))?;
        Ok(ConnectTarget { kind, url })
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub endpoint: SignalingEndpoint,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: Option<u32>,
    pub preferred: TransportKind,
    pub flush_interval: Duration,
    pub throughput_cap: usize,
}

/// Outbound path shared by every peer session.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, message: SignalMessage) -> Result<(), SignalingError>;
}
