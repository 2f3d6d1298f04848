use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::connector::{ConnectTarget, ConnectionIo, Connector, InboundFrame};
use crate::error::SignalingError;

/// Consecutive rejected sends after which the session is treated as lost.
const MAX_SEND_REJECTIONS: u32 = 3;

#[derive(Debug, Deserialize)]
struct SessionReply {
    sid: String,
}

/// Long-lived polling session against the relay's HTTP endpoints:
/// `POST {base}/session` opens it, `GET {base}/poll?sid=` returns pending
/// frames and `POST {base}/send?sid=` delivers outbound ones.
pub struct PollingConnector {
    client: Client,
    poll_interval: Duration,
}

impl PollingConnector {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_client(Client::new(), poll_interval)
    }

    pub fn with_client(client: Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }
}

fn endpoint(base: &Url, segment: &str, sid: Option<&str>) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(segment);
    }
    if let Some(sid) = sid {
        url.query_pairs_mut().append_pair("sid", sid);
    }
    url
}

#[async_trait]
impl Connector for PollingConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<ConnectionIo, SignalingError> {
        let connect_error = |reason: String| SignalingError::Connect {
            kind: target.kind,
            target: target.url.to_string(),
            reason,
        };
        let response = self
            .client
            .post(endpoint(&target.url, "session", None))
            .send()
            .await
            .map_err(|err| connect_error(err.to_string()))?;
        if !response.status().is_success() {
            return Err(connect_error(format!(
                "unexpected signaling status {}",
                response.status()
            )));
        }
        let SessionReply { sid } = response
            .json::<SessionReply>()
            .await
            .map_err(|err| connect_error(err.to_string()))?;
        tracing::debug!(
            target = "signaling",
            url = %target.url,
            sid = %sid,
            "signaling polling session opened"
        );

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let (writer_failed_tx, writer_failed) = oneshot::channel::<String>();

        // the poller owns the only inbound sender; when it ends the stream closes
        let poll_url = endpoint(&target.url, "poll", Some(&sid));
        let client = self.client.clone();
        let interval = self.poll_interval;
        let poller = tokio::spawn(async move {
            let reason = tokio::select! {
                failure = writer_failed => {
                    failure.unwrap_or_else(|_| "signaling writer stopped".to_string())
                }
                reason = poll_frames(&client, &poll_url, interval, &inbound_tx) => reason,
            };
            tracing::warn!(target = "signaling", "signaling polling session ended: {reason}");
            let _ = inbound_tx.send(InboundFrame::Error(reason));
        });

        let send_url = endpoint(&target.url, "send", Some(&sid));
        let client = self.client.clone();
        let writer = tokio::spawn(async move {
            let mut pending: Vec<String> = Vec::new();
            let mut rejections = 0;
            loop {
                if pending.is_empty() {
                    match outbound_rx.recv().await {
                        Some(frame) => pending.push(frame),
                        None => break,
                    }
                }
                while let Ok(next) = outbound_rx.try_recv() {
                    pending.push(next);
                }
                let failure = match client.post(send_url.clone()).json(&pending).send().await {
                    Ok(response) if response.status().is_success() => {
                        pending.clear();
                        rejections = 0;
                        continue;
                    }
                    Ok(response) => {
                        rejections += 1;
                        tracing::warn!(
                            target = "signaling",
                            status = %response.status(),
                            pending = pending.len(),
                            rejections,
                            "signaling send rejected"
                        );
                        if rejections < MAX_SEND_REJECTIONS {
                            tokio::time::sleep(interval).await;
                            continue;
                        }
                        format!("signaling send rejected with {}", response.status())
                    }
                    Err(err) => format!("signaling send failed: {err}"),
                };
                tracing::debug!(target = "signaling", lost = pending.len(), "signaling writer giving up");
                let _ = writer_failed_tx.send(failure);
                break;
            }
        });

        Ok(ConnectionIo {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![poller, writer],
        })
    }
}

/// Forwards polled frames until polling fails or the transport stops
/// listening, and returns why it stopped.
async fn poll_frames(
    client: &Client,
    url: &Url,
    interval: Duration,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
) -> String {
    loop {
        let frames = match fetch_frames(client, url).await {
            Ok(frames) => frames,
            Err(reason) => return format!("signaling poll failed: {reason}"),
        };
        for frame in frames {
            if inbound.send(InboundFrame::Text(frame)).is_err() {
                return "inbound stream closed".to_string();
            }
        }
        tokio::time::sleep(interval).await;
    }
}

async fn fetch_frames(client: &Client, url: &Url) -> Result<Vec<String>, String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| err.to_string())?;
    match response.status() {
        StatusCode::OK => response
            .json::<Vec<String>>()
            .await
            .map_err(|err| err.to_string()),
        StatusCode::NO_CONTENT => Ok(Vec::new()),
        status => Err(format!("unexpected signaling status {status}")),
    }
}
