use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};

use super::connector::{ConnectTarget, ConnectionIo, Connector, InboundFrame};
use crate::error::SignalingError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct WebSocketConnector {
    heartbeat: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<ConnectionIo, SignalingError> {
        let (ws_stream, _) =
            connect_async(target.url.as_str())
                .await
                .map_err(|err| SignalingError::Connect {
                    kind: target.kind,
                    target: target.url.to_string(),
                    reason: err.to_string(),
                })?;
        tracing::debug!(
            target = "signaling",
            url = %target.url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();

        let heartbeat = self.heartbeat;
        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        let Some(text) = next else { break };
                        tracing::trace!(target = "signaling", event = "ws_out", len = text.len());
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target = "signaling", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "signaling websocket error: {err}"
                                );
                                let _ = inbound_tx.send(InboundFrame::Error(err.to_string()));
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                if inbound_tx.send(InboundFrame::Text(text)).is_err() {
                    break;
                }
            }
        });

        Ok(ConnectionIo {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![writer, reader],
        })
    }
}
