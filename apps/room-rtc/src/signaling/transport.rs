use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use super::batch::{OutboundBatcher, Submit};
use super::connector::{ConnectionIo, Connector, InboundFrame};
use super::cursor::{Advance, PortCursor};
use super::{
    ConnectErrorCode, SignalSink, TransportEvent, TransportKind, TransportOptions,
};
use crate::error::SignalingError;
use crate::protocol::SignalMessage;

struct Link {
    epoch: u64,
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn close(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct TransportState {
    cursor: PortCursor,
    dead: bool,
    ever_connected: bool,
    closing: bool,
    epoch: u64,
    link: Option<Link>,
    batcher: OutboundBatcher,
    drain_task: Option<JoinHandle<()>>,
}

impl TransportState {
    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(task) = self.drain_task.take() {
            task.abort();
        }
        self.batcher.pause();
    }
}

/// Process-wide connection to the signaling relay.
///
/// Connection attempts walk every configured port under the preferred
/// transport kind and then under the fallback kind; once both are exhausted
/// the transport is dead for good. Flood-prone message types go through an
/// [`OutboundBatcher`] and leave as `group` frames from a single timer-driven
/// drain task, so writes to the connection are serialized.
pub struct SignalingTransport {
    options: TransportOptions,
    connector: Arc<dyn Connector>,
    weak_self: Weak<SignalingTransport>,
    state: Mutex<TransportState>,
    campaign: AsyncMutex<()>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl SignalingTransport {
    pub fn new(options: TransportOptions, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cursor = PortCursor::new(
            options.endpoint.ports(),
            options.preferred,
            options.max_reconnect_attempts,
        );
        let batcher = OutboundBatcher::new(options.flush_interval, options.throughput_cap);
        Arc::new_cyclic(|weak_self| Self {
            options,
            connector,
            weak_self: weak_self.clone(),
            state: Mutex::new(TransportState {
                cursor,
                dead: false,
                ever_connected: false,
                closing: false,
                epoch: 0,
                link: None,
                batcher,
                drain_task: None,
            }),
            campaign: AsyncMutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Takes the event stream. Only the first call returns it.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Kind of the live connection, or of the next attempt when disconnected.
    pub fn transport_kind(&self) -> TransportKind {
        let state = self.state.lock();
        match &state.link {
            Some(link) => link.kind,
            None => state.cursor.kind(),
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().batcher.len()
    }

    pub async fn connect(&self) -> Result<(), SignalingError> {
        {
            let state = self.state.lock();
            if state.dead {
                return Err(SignalingError::Dead);
            }
            if state.link.is_some() {
                return Ok(());
            }
        }
        let Ok(_campaign) = self.campaign.try_lock() else {
            let kind = self.transport_kind();
            tracing::debug!(target = "signaling", "connect requested while a campaign is running");
            self.emit(TransportEvent::ConnectError {
                code: ConnectErrorCode::ReconnectInProgress,
                error: SignalingError::ReconnectInProgress.to_string(),
                kind,
            });
            return Err(SignalingError::ReconnectInProgress);
        };
        {
            let mut state = self.state.lock();
            state.closing = false;
            state.cursor.reset();
        }
        self.run_campaign().await
    }

    pub fn disconnect(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            state.closing = true;
            let was_connected = state.link.is_some();
            state.teardown();
            was_connected
        };
        if !was_connected {
            return;
        }
        tracing::info!(target = "signaling", "signaling transport disconnected");
        self.emit(TransportEvent::Disconnect { requested: true });
    }

    /// Hands a message to the outbound path. Immediate types are written
    /// right away; must-queue types may wait for the next drain. A write to a
    /// connection whose writer has gone away counts as losing the connection.
    pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let lost_epoch = {
            let mut state = self.state.lock();
            if state.dead {
                return Err(SignalingError::Dead);
            }
            let Some((epoch, outbound)) = state
                .link
                .as_ref()
                .map(|link| (link.epoch, link.outbound.clone()))
            else {
                return Err(SignalingError::NotConnected);
            };
            let frame = message.encode()?;
            match state.batcher.submit(message, Instant::now()) {
                Submit::SendNow(message) => {
                    tracing::trace!(
                        target = "signaling",
                        event = "send",
                        message_type = message.type_name(),
                        mid = %message.mid
                    );
                    if outbound.send(frame).is_ok() {
                        return Ok(());
                    }
                    epoch
                }
                Submit::Queued { schedule_drain } => {
                    tracing::trace!(
                        target = "signaling",
                        event = "queued",
                        queued = state.batcher.len()
                    );
                    if schedule_drain {
                        self.spawn_drain(&mut state);
                    }
                    return Ok(());
                }
            }
        };
        self.on_connection_lost(lost_epoch);
        Err(SignalingError::ChannelClosed)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn run_campaign(&self) -> Result<(), SignalingError> {
        let mut attempt: u32 = 0;
        loop {
            let (kind, port, ever_connected) = {
                let mut state = self.state.lock();
                if state.dead {
                    return Err(SignalingError::Dead);
                }
                if state.closing {
                    return Err(SignalingError::NotConnected);
                }
                state.teardown();
                (
                    state.cursor.kind(),
                    state.cursor.port(),
                    state.ever_connected,
                )
            };
            let Some(port) = port else {
                return Err(self.mark_dead(kind, "no signaling ports configured".into()));
            };
            if attempt > 0 {
                self.emit(TransportEvent::ConnectRetry { kind, attempt });
            }
            tracing::debug!(
                target = "signaling",
                ?kind,
                port,
                attempt,
                "opening signaling connection"
            );

            let opened = match self.options.endpoint.target(kind, port) {
                Ok(target) => {
                    let url = target.url.to_string();
                    match timeout(self.options.connect_timeout, self.connector.open(&target)).await
                    {
                        Ok(Ok(io)) => Ok((url, io)),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(SignalingError::Timeout { kind, target: url }),
                    }
                }
                Err(err) => Err(err),
            };

            match opened {
                Ok((url, io)) => {
                    return if self.install(kind, url, io) {
                        Ok(())
                    } else {
                        Err(SignalingError::NotConnected)
                    };
                }
                Err(err) => {
                    let code = if ever_connected {
                        ConnectErrorCode::ReconnectFailed
                    } else {
                        ConnectErrorCode::InitialConnect
                    };
                    tracing::warn!(
                        target = "signaling",
                        ?kind,
                        port,
                        code = code.code(),
                        "signaling connect failed: {err}"
                    );
                    self.emit(TransportEvent::ConnectError {
                        code,
                        error: err.to_string(),
                        kind,
                    });
                    let advance = self.state.lock().cursor.record_failure();
                    match advance {
                        Advance::NextPort => {}
                        Advance::Fallback => {
                            tracing::info!(
                                target = "signaling",
                                "primary transport exhausted; switching to fallback"
                            );
                        }
                        Advance::Exhausted => return Err(self.mark_dead(kind, err.to_string())),
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn mark_dead(&self, kind: TransportKind, reason: String) -> SignalingError {
        let newly_dead = {
            let mut state = self.state.lock();
            let newly_dead = !state.dead;
            state.dead = true;
            state.teardown();
            newly_dead
        };
        if newly_dead {
            tracing::error!(
                target = "signaling",
                "signaling transport exhausted every port and transport: {reason}"
            );
            self.emit(TransportEvent::ConnectError {
                code: ConnectErrorCode::Exhausted,
                error: reason,
                kind,
            });
        }
        SignalingError::Dead
    }

    fn install(&self, kind: TransportKind, url: String, io: ConnectionIo) -> bool {
        let ConnectionIo {
            outbound,
            mut inbound,
            mut tasks,
        } = io;
        let mut state = self.state.lock();
        if state.closing || state.dead {
            for task in tasks {
                task.abort();
            }
            return false;
        }
        state.epoch += 1;
        let epoch = state.epoch;
        state.ever_connected = true;
        tracing::info!(target = "signaling", ?kind, url = %url, "signaling transport connected");
        self.emit(TransportEvent::Connect { kind, target: url });

        let events = self.events_tx.clone();
        let weak = self.weak_self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let event = match frame {
                    InboundFrame::Text(text) => match SignalMessage::decode(&text) {
                        Ok(message) => TransportEvent::Message(message),
                        Err(err) => {
                            tracing::warn!(
                                target = "signaling",
                                len = text.len(),
                                "discarding malformed frame: {err}"
                            );
                            TransportEvent::Error(format!("malformed frame: {err}"))
                        }
                    },
                    InboundFrame::Error(reason) => TransportEvent::Error(reason),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            if let Some(transport) = weak.upgrade() {
                transport.on_connection_lost(epoch);
            }
        }));
        state.link = Some(Link {
            epoch,
            kind,
            outbound,
            tasks,
        });
        if state.batcher.resume() {
            self.spawn_drain(&mut state);
        }
        true
    }

    fn on_connection_lost(&self, epoch: u64) {
        let reconnect = {
            let mut state = self.state.lock();
            if state.link.as_ref().map(|link| link.epoch) != Some(epoch) {
                return;
            }
            state.teardown();
            !state.closing && !state.dead
        };
        tracing::warn!(target = "signaling", epoch, "signaling connection lost");
        self.emit(TransportEvent::Disconnect { requested: false });
        if !reconnect {
            return;
        }
        let Some(transport) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            transport.reconnect().await;
        });
    }

    async fn reconnect(&self) {
        let Ok(_campaign) = self.campaign.try_lock() else {
            return;
        };
        self.state.lock().cursor.reset();
        if let Err(err) = self.run_campaign().await {
            tracing::debug!(target = "signaling", "reconnect campaign ended: {err}");
        }
    }

    fn spawn_drain(&self, state: &mut TransportState) {
        if let Some(task) = state.drain_task.take() {
            task.abort();
        }
        let weak = self.weak_self.clone();
        state.drain_task = Some(tokio::spawn(drain_loop(weak)));
    }
}

async fn drain_loop(weak: Weak<SignalingTransport>) {
    loop {
        let deadline = {
            let Some(transport) = weak.upgrade() else {
                return;
            };
            let state = transport.state.lock();
            state.batcher.next_drain_at(Instant::now())
        };
        tokio::time::sleep_until(deadline).await;

        let Some(transport) = weak.upgrade() else {
            return;
        };
        let lost_epoch = {
            let mut state = transport.state.lock();
            let (batch, more) = state.batcher.drain(Instant::now());
            if batch.is_empty() {
                return;
            }
            let Some((epoch, outbound)) = state
                .link
                .as_ref()
                .map(|link| (link.epoch, link.outbound.clone()))
            else {
                hold_batch(&mut state, batch);
                return;
            };
            let count = batch.len();
            let frame = match SignalMessage::group(batch.clone()).map(|group| group.encode()) {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    // messages were encodable on submit; keep them for the next link
                    tracing::error!(
                        target = "signaling",
                        count,
                        "queued batch failed to encode: {err}"
                    );
                    hold_batch(&mut state, batch);
                    return;
                }
                None => return,
            };
            if outbound.send(frame).is_ok() {
                tracing::debug!(target = "signaling", count, more, "flushed queued messages");
                if !more {
                    return;
                }
                None
            } else {
                hold_batch(&mut state, batch);
                Some(epoch)
            }
        };
        if let Some(epoch) = lost_epoch {
            transport.on_connection_lost(epoch);
            return;
        }
    }
}

/// Puts an unsent batch back at the head of the queue and stops draining
/// until the next link resumes it.
fn hold_batch(state: &mut TransportState, batch: Vec<SignalMessage>) {
    state.batcher.requeue_front(batch);
    state.batcher.pause();
}

impl SignalSink for SignalingTransport {
    fn send_signal(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.send(message)
    }
}
