use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::{PollingConnector, TransportKind, WebSocketConnector};
use crate::error::SignalingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub kind: TransportKind,
    pub url: Url,
}

#[derive(Debug)]
pub enum InboundFrame {
    Text(String),
    /// The connection reported an error; the stream ends after it.
    Error(String),
}

/// An established relay connection. Frames written to `outbound` are sent
/// in order; `inbound` closes when the connection goes away. `tasks` are
/// aborted on teardown so no stale reader survives a reconnect.
pub struct ConnectionIo {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
    pub tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, target: &ConnectTarget) -> Result<ConnectionIo, SignalingError>;
}

/// Opens a WebSocket for primary targets and a polling session for fallback ones.
pub struct DefaultConnector {
    websocket: WebSocketConnector,
    polling: PollingConnector,
}

impl DefaultConnector {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            websocket: WebSocketConnector::default(),
            polling: PollingConnector::new(poll_interval),
        }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<ConnectionIo, SignalingError> {
        match target.kind {
            TransportKind::Primary => self.websocket.open(target).await,
            TransportKind::Fallback => self.polling.open(target).await,
        }
    }
}
