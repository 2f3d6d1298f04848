use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use super::connection::{DataChannel, PeerConnection, PeerConnectionFactory, PrimitiveEvent};
use super::{
    ConnectionState, IceCandidate, IceConnectionState, InboundStream, LocalStream, MAIN_CHANNEL,
    MediaConstraints, PeerEvent, SdpType, SessionDescription, SessionEvent, SignalingState,
    TrackInfo,
};
use crate::error::{NegotiationError, NegotiationStage, PrimitiveError};
use crate::metadata::PeerMetadataStore;
use crate::protocol::{SignalBody, SignalMessage};
use crate::sdp::SdpTransform;
use crate::signaling::SignalSink;

type Reply<T> = oneshot::Sender<Result<T, NegotiationError>>;

enum Command {
    Connect(MediaConstraints, Reply<()>),
    Close(Reply<()>),
    CreateOffer(Reply<SessionDescription>),
    CreateAnswer(Reply<SessionDescription>),
    SetLocalDescription(SessionDescription, Reply<()>),
    SetRemoteDescription(SessionDescription, Reply<()>),
    AddCandidate(IceCandidate, Reply<()>),
    SendStream(LocalStream, Reply<()>),
    CreateDataChannel(Option<String>, Reply<String>),
    SendData {
        label: Option<String>,
        payload: ChannelPayload,
        reply: Reply<()>,
    },
    Restart(Reply<SessionDescription>),
    Signal(SignalMessage, Option<Reply<()>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

/// Everything a session needs from the room it belongs to.
pub struct SessionContext {
    pub peer_id: String,
    pub local_mid: String,
    pub room_id: String,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub signals: Arc<dyn SignalSink>,
    pub metadata: Arc<dyn PeerMetadataStore>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Point-in-time view of a session's negotiation state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub peer_id: String,
    pub connection_state: ConnectionState,
    pub signaling_state: SignalingState,
    pub ice_state: IceConnectionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub pending_candidates: usize,
    pub applying_candidates_immediately: bool,
    pub main_channel: Option<String>,
    pub transfer_channels: Vec<String>,
    pub inbound_stream: Option<InboundStream>,
    pub local_stream: Option<LocalStream>,
}

/// Cloneable front of a running [`PeerSession`]. Requests are processed one
/// at a time in submission order.
#[derive(Clone)]
pub struct PeerSessionHandle {
    peer_id: String,
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<watch::Sender<bool>>,
}

impl PeerSessionHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NegotiationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| NegotiationError::Closed)?;
        reply_rx.await.map_err(|_| NegotiationError::Closed)?
    }

    /// Creates the underlying peer connection. Idempotent once created.
    pub async fn connect(&self, constraints: MediaConstraints) -> Result<(), NegotiationError> {
        self.request(|reply| Command::Connect(constraints, reply))
            .await
    }

    /// Tears the session down. Any primitive call still in flight is
    /// abandoned and its result is never applied.
    pub async fn disconnect(&self) -> Result<(), NegotiationError> {
        self.closed.send_replace(true);
        self.request(Command::Close).await
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.request(Command::CreateOffer).await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.request(Command::CreateAnswer).await
    }

    pub async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.request(|reply| Command::SetLocalDescription(desc, reply))
            .await
    }

    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.request(|reply| Command::SetRemoteDescription(desc, reply))
            .await
    }

    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.request(|reply| Command::AddCandidate(candidate, reply))
            .await
    }

    /// Attaches local media; renegotiates when the session is already connected.
    pub async fn send_stream(&self, stream: LocalStream) -> Result<(), NegotiationError> {
        self.request(|reply| Command::SendStream(stream, reply))
            .await
    }

    /// Opens the main chat channel, or a transfer channel labelled with
    /// `transfer_id`. Returns the label.
    pub async fn create_data_channel(
        &self,
        transfer_id: Option<String>,
    ) -> Result<String, NegotiationError> {
        self.request(|reply| Command::CreateDataChannel(transfer_id, reply))
            .await
    }

    pub async fn send_text(
        &self,
        label: Option<String>,
        text: impl Into<String>,
    ) -> Result<(), NegotiationError> {
        let payload = ChannelPayload::Text(text.into());
        self.request(|reply| Command::SendData {
            label,
            payload,
            reply,
        })
        .await
    }

    pub async fn send_bytes(
        &self,
        label: Option<String>,
        data: Bytes,
    ) -> Result<(), NegotiationError> {
        let payload = ChannelPayload::Binary(data);
        self.request(|reply| Command::SendData {
            label,
            payload,
            reply,
        })
        .await
    }

    /// Supersedes the current round and starts a fresh offer. Also the only
    /// way out of `failed`.
    pub async fn restart(&self) -> Result<SessionDescription, NegotiationError> {
        self.request(Command::Restart).await
    }

    /// Processes an inbound signaling message and waits for the outcome.
    pub async fn handle_signal(&self, message: SignalMessage) -> Result<(), NegotiationError> {
        self.request(|reply| Command::Signal(message, Some(reply)))
            .await
    }

    /// Queues an inbound signaling message without waiting.
    pub fn deliver(&self, message: SignalMessage) -> Result<(), NegotiationError> {
        self.commands
            .send(Command::Signal(message, None))
            .map_err(|_| NegotiationError::Closed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, NegotiationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| NegotiationError::Closed)?;
        reply_rx.await.map_err(|_| NegotiationError::Closed)
    }
}

/// Negotiation state of one remote peer, owned by a single task.
pub struct PeerSession {
    peer_id: String,
    local_mid: String,
    room_id: String,
    factory: Arc<dyn PeerConnectionFactory>,
    signals: Arc<dyn SignalSink>,
    metadata: Arc<dyn PeerMetadataStore>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,

    state: ConnectionState,
    signaling_state: SignalingState,
    ice_state: IceConnectionState,
    pc: Option<Arc<dyn PeerConnection>>,
    primitive_events: Option<mpsc::UnboundedReceiver<PrimitiveEvent>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    apply_immediately: bool,
    main_channel: Option<Arc<dyn DataChannel>>,
    transfer_channels: HashMap<String, Arc<dyn DataChannel>>,
    inbound_stream: Option<InboundStream>,
    local_stream: Option<LocalStream>,
}

enum Step {
    Command(Option<Command>),
    Primitive(Option<PrimitiveEvent>),
}

impl PeerSession {
    pub fn spawn(ctx: SessionContext) -> PeerSessionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let handle = PeerSessionHandle {
            peer_id: ctx.peer_id.clone(),
            commands: commands_tx,
            closed: Arc::clone(&closed_tx),
        };
        let session = PeerSession {
            peer_id: ctx.peer_id,
            local_mid: ctx.local_mid,
            room_id: ctx.room_id,
            factory: ctx.factory,
            signals: ctx.signals,
            metadata: ctx.metadata,
            events: ctx.events,
            closed_tx,
            closed: closed_rx,
            state: ConnectionState::New,
            signaling_state: SignalingState::Stable,
            ice_state: IceConnectionState::New,
            pc: None,
            primitive_events: None,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            apply_immediately: false,
            main_channel: None,
            transfer_channels: HashMap::new(),
            inbound_stream: None,
            local_stream: None,
        };
        tokio::spawn(session.run(commands_rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(target = "peer", peer_id = %self.peer_id, "session started");
        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                event = next_primitive_event(&mut self.primitive_events) => Step::Primitive(event),
            };
            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => break,
                Step::Primitive(Some(event)) => self.handle_primitive(event),
                Step::Primitive(None) => self.primitive_events = None,
            }
        }
        if self.state != ConnectionState::Closed {
            let _ = self.close().await;
        }
        tracing::debug!(target = "peer", peer_id = %self.peer_id, "session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(constraints, reply) => {
                let _ = reply.send(self.connect(constraints).await);
            }
            Command::Close(reply) => {
                let _ = reply.send(self.close().await);
            }
            Command::CreateOffer(reply) => {
                let _ = reply.send(self.create_offer().await);
            }
            Command::CreateAnswer(reply) => {
                let _ = reply.send(self.create_answer().await);
            }
            Command::SetLocalDescription(desc, reply) => {
                let _ = reply.send(self.set_local_description(desc).await);
            }
            Command::SetRemoteDescription(desc, reply) => {
                let _ = reply.send(self.set_remote_description(desc).await);
            }
            Command::AddCandidate(candidate, reply) => {
                let _ = reply.send(self.add_candidate(candidate).await);
            }
            Command::SendStream(stream, reply) => {
                let _ = reply.send(self.send_stream(stream).await);
            }
            Command::CreateDataChannel(transfer_id, reply) => {
                let _ = reply.send(self.create_data_channel(transfer_id).await);
            }
            Command::SendData {
                label,
                payload,
                reply,
            } => {
                let _ = reply.send(self.send_data(label, payload).await);
            }
            Command::Restart(reply) => {
                let _ = reply.send(self.restart().await);
            }
            Command::Signal(message, reply) => {
                let result = self.handle_signal(message).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            tracing::debug!(
                                target = "peer",
                                peer_id = %self.peer_id,
                                "inbound signal not applied: {err}"
                            );
                        }
                    }
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        tracing::trace!(target = "peer", peer_id = %self.peer_id, event = event.name());
        self.metadata.negotiation_event(&self.peer_id, &event);
        let _ = self.events.send(SessionEvent {
            peer_id: self.peer_id.clone(),
            event,
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(
            target = "peer",
            peer_id = %self.peer_id,
            from = ?self.state,
            to = ?state,
            "connection state changed"
        );
        self.state = state;
        self.emit(PeerEvent::ConnectionState(state));
    }

    fn update_signaling_state(&mut self, state: SignalingState) {
        if self.signaling_state != state {
            self.signaling_state = state;
            self.emit(PeerEvent::SignalingState(state));
        }
    }

    fn fail(&mut self, stage: NegotiationStage, err: PrimitiveError) -> NegotiationError {
        self.fail_round(NegotiationError::primitive(stage, err))
    }

    /// Ends the current round in `failed`; only a restart leaves it.
    fn fail_round(&mut self, error: NegotiationError) -> NegotiationError {
        tracing::warn!(
            target = "peer",
            peer_id = %self.peer_id,
            "negotiation failed: {error}"
        );
        self.set_state(ConnectionState::Failed);
        self.emit(PeerEvent::Failed {
            error: error.to_string(),
        });
        error
    }

    fn discard(&self, message_type: &'static str, reason: &str) {
        tracing::info!(
            target = "peer",
            peer_id = %self.peer_id,
            message_type,
            state = ?self.state,
            "discarding inbound {message_type}: {reason}"
        );
        self.emit(PeerEvent::Discarded {
            message_type,
            reason: reason.to_string(),
        });
    }

    fn ensure_open(&self, op: &'static str) -> Result<(), NegotiationError> {
        match self.state {
            ConnectionState::Closed => Err(NegotiationError::Closed),
            ConnectionState::Failed => Err(NegotiationError::InvalidState {
                op,
                state: self.state,
            }),
            _ => Ok(()),
        }
    }

    fn require_pc(&self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.pc.clone().ok_or(NegotiationError::NotStarted)
    }

    fn transform(&self) -> SdpTransform {
        SdpTransform::from_settings(&self.metadata.media_settings(&self.peer_id))
    }

    fn send(&self, body: SignalBody) -> Result<(), NegotiationError> {
        let message =
            SignalMessage::new(&self.local_mid, &self.room_id, body).with_target(&self.peer_id);
        let message_type = message.type_name();
        self.signals.send_signal(message).map_err(|err| {
            tracing::warn!(
                target = "peer",
                peer_id = %self.peer_id,
                message_type,
                "signal not sent: {err}"
            );
            NegotiationError::Send(err.to_string())
        })
    }

    /// Starts a new round: descriptions of the previous one no longer apply
    /// and candidates buffer until the next remote description lands.
    fn start_round(&mut self) {
        self.local_description = None;
        self.remote_description = None;
        self.apply_immediately = false;
    }

    fn maybe_connected(&mut self) {
        if self.state == ConnectionState::Offering
            && self.remote_description.is_some()
            && self.signaling_state == SignalingState::Stable
        {
            self.set_state(ConnectionState::Connected);
        }
    }

    async fn connect(&mut self, constraints: MediaConstraints) -> Result<(), NegotiationError> {
        self.ensure_open("connect")?;
        if self.pc.is_some() {
            return Ok(());
        }
        let created = guarded(&mut self.closed, self.factory.create(&constraints))
            .await
            .ok_or(NegotiationError::Closed)?;
        match created {
            Ok((pc, events)) => {
                tracing::debug!(
                    target = "peer",
                    peer_id = %self.peer_id,
                    audio = constraints.audio,
                    video = constraints.video,
                    "peer connection created"
                );
                self.pc = Some(pc);
                self.primitive_events = Some(events);
                Ok(())
            }
            Err(err) => Err(self.fail(NegotiationStage::Connect, err)),
        }
    }

    async fn close(&mut self) -> Result<(), NegotiationError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.closed_tx.send_replace(true);
        self.primitive_events = None;
        self.pending_candidates.clear();
        self.main_channel = None;
        self.transfer_channels.clear();
        if let Some(pc) = self.pc.take() {
            if let Err(err) = pc.close().await {
                tracing::debug!(
                    target = "peer",
                    peer_id = %self.peer_id,
                    "peer connection close reported: {err}"
                );
            }
        }
        self.update_signaling_state(SignalingState::Closed);
        self.set_state(ConnectionState::Closed);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open("create offer")?;
        if self.state.round_in_flight() {
            return Err(NegotiationError::RoundInFlight(self.state));
        }
        self.offer_round().await
    }

    async fn offer_round(&mut self) -> Result<SessionDescription, NegotiationError> {
        let pc = self.require_pc()?;
        self.start_round();
        self.set_state(ConnectionState::Offering);
        let offer = match guarded(&mut self.closed, pc.create_offer()).await {
            None => return Err(NegotiationError::Closed),
            Some(Ok(offer)) => offer,
            Some(Err(err)) => {
                self.emit(PeerEvent::LocalOffer(Err(err.to_string())));
                return Err(self.fail(NegotiationStage::CreateOffer, err));
            }
        };
        let offer = SessionDescription::offer(self.transform().apply(&offer.sdp));
        self.emit(PeerEvent::LocalOffer(Ok(())));
        self.apply_local(&pc, offer.clone()).await?;
        if let Err(err) = self.send(SignalBody::Offer {
            sdp: offer.sdp.clone(),
        }) {
            return Err(self.fail_round(err));
        }
        Ok(offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open("create answer")?;
        let remote_offer = matches!(
            self.remote_description,
            Some(SessionDescription {
                sdp_type: SdpType::Offer,
                ..
            })
        );
        if self.state != ConnectionState::Answering
            || !remote_offer
            || self.local_description.is_some()
        {
            return Err(NegotiationError::InvalidState {
                op: "create answer",
                state: self.state,
            });
        }
        self.answer_round().await
    }

    async fn answer_round(&mut self) -> Result<SessionDescription, NegotiationError> {
        let pc = self.require_pc()?;
        let answer = match guarded(&mut self.closed, pc.create_answer()).await {
            None => return Err(NegotiationError::Closed),
            Some(Ok(answer)) => answer,
            Some(Err(err)) => {
                self.emit(PeerEvent::LocalAnswer(Err(err.to_string())));
                return Err(self.fail(NegotiationStage::CreateAnswer, err));
            }
        };
        let answer = SessionDescription::answer(self.transform().apply(&answer.sdp));
        self.emit(PeerEvent::LocalAnswer(Ok(())));
        self.apply_local(&pc, answer.clone()).await?;
        if let Err(err) = self.send(SignalBody::Answer {
            sdp: answer.sdp.clone(),
        }) {
            return Err(self.fail_round(err));
        }
        self.set_state(ConnectionState::Connected);
        Ok(answer)
    }

    async fn apply_local(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let sdp_type = desc.sdp_type;
        match guarded(&mut self.closed, pc.set_local_description(desc.clone())).await {
            None => Err(NegotiationError::Closed),
            Some(Ok(())) => {
                self.local_description = Some(desc);
                self.emit(PeerEvent::LocalDescription(Ok(sdp_type)));
                self.update_signaling_state(pc.signaling_state());
                Ok(())
            }
            Some(Err(err)) => {
                self.emit(PeerEvent::LocalDescription(Err(err.to_string())));
                Err(self.fail(NegotiationStage::SetLocalDescription, err))
            }
        }
    }

    async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open("set local description")?;
        let pc = self.require_pc()?;
        match desc.sdp_type {
            SdpType::Offer => {
                if self.state.round_in_flight() {
                    return Err(NegotiationError::RoundInFlight(self.state));
                }
                self.start_round();
                self.set_state(ConnectionState::Offering);
                self.apply_local(&pc, desc).await
            }
            SdpType::Answer => {
                if self.state != ConnectionState::Answering {
                    return Err(NegotiationError::InvalidState {
                        op: "set local answer",
                        state: self.state,
                    });
                }
                self.apply_local(&pc, desc).await?;
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
        }
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open("set remote description")?;
        let pc = self.require_pc()?;
        match desc.sdp_type {
            SdpType::Offer => {
                if self.state.round_in_flight() {
                    return Err(NegotiationError::RoundInFlight(self.state));
                }
                self.start_round();
                self.set_state(ConnectionState::Answering);
                self.apply_remote(&pc, desc).await
            }
            SdpType::Answer => {
                if self.state != ConnectionState::Offering || self.remote_description.is_some() {
                    return Err(NegotiationError::InvalidState {
                        op: "set remote answer",
                        state: self.state,
                    });
                }
                self.apply_remote(&pc, desc).await?;
                self.maybe_connected();
                Ok(())
            }
        }
    }

    async fn apply_remote(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let sdp_type = desc.sdp_type;
        match guarded(&mut self.closed, pc.set_remote_description(desc.clone())).await {
            None => return Err(NegotiationError::Closed),
            Some(Ok(())) => {}
            Some(Err(err)) => {
                self.emit(PeerEvent::RemoteDescription(Err(err.to_string())));
                return Err(self.fail(NegotiationStage::SetRemoteDescription, err));
            }
        }
        self.remote_description = Some(desc);
        self.emit(PeerEvent::RemoteDescription(Ok(sdp_type)));
        self.update_signaling_state(pc.signaling_state());
        self.drain_candidates(pc).await
    }

    /// Applies every buffered candidate in arrival order, then switches the
    /// round to applying candidates as they come.
    async fn drain_candidates(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
    ) -> Result<(), NegotiationError> {
        let buffered = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(pc, candidate).await?;
        }
        self.apply_immediately = true;
        if buffered > 0 {
            tracing::debug!(
                target = "peer",
                peer_id = %self.peer_id,
                buffered,
                "applied buffered candidates"
            );
        }
        Ok(())
    }

    async fn apply_candidate(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        match guarded(&mut self.closed, pc.add_ice_candidate(candidate)).await {
            None => Err(NegotiationError::Closed),
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                tracing::warn!(
                    target = "peer",
                    peer_id = %self.peer_id,
                    "remote candidate rejected: {err}"
                );
                Ok(())
            }
        }
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open("add candidate")?;
        let pc = if self.apply_immediately {
            self.pc.clone()
        } else {
            None
        };
        match pc {
            Some(pc) => self.apply_candidate(&pc, candidate).await,
            None => {
                self.pending_candidates.push_back(candidate);
                tracing::trace!(
                    target = "peer",
                    peer_id = %self.peer_id,
                    pending = self.pending_candidates.len(),
                    "buffered remote candidate"
                );
                Ok(())
            }
        }
    }

    async fn restart(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.state == ConnectionState::Closed {
            return Err(NegotiationError::Closed);
        }
        self.require_pc()?;
        let discarded = self.pending_candidates.len();
        self.pending_candidates.clear();
        tracing::info!(
            target = "peer",
            peer_id = %self.peer_id,
            superseded = ?self.state,
            discarded,
            "restarting negotiation"
        );
        self.offer_round().await
    }

    async fn send_stream(&mut self, stream: LocalStream) -> Result<(), NegotiationError> {
        self.ensure_open("send stream")?;
        let pc = self.require_pc()?;
        match guarded(&mut self.closed, pc.add_stream(&stream)).await {
            None => return Err(NegotiationError::Closed),
            Some(Ok(())) => {}
            Some(Err(err)) => {
                return Err(NegotiationError::primitive(
                    NegotiationStage::AttachStream,
                    err,
                ));
            }
        }
        tracing::debug!(
            target = "peer",
            peer_id = %self.peer_id,
            stream_id = %stream.id,
            "local stream attached"
        );
        self.local_stream = Some(stream);
        if self.state == ConnectionState::Connected {
            self.offer_round().await?;
        }
        Ok(())
    }

    async fn create_data_channel(
        &mut self,
        transfer_id: Option<String>,
    ) -> Result<String, NegotiationError> {
        self.ensure_open("create data channel")?;
        let pc = self.require_pc()?;
        let label = transfer_id.unwrap_or_else(|| MAIN_CHANNEL.to_string());
        let channel = match guarded(&mut self.closed, pc.create_data_channel(&label)).await {
            None => return Err(NegotiationError::Closed),
            Some(Ok(channel)) => channel,
            Some(Err(err)) => {
                return Err(NegotiationError::primitive(
                    NegotiationStage::CreateDataChannel,
                    err,
                ));
            }
        };
        self.attach_channel(channel);
        Ok(label)
    }

    fn channel(&self, label: Option<&str>) -> Option<Arc<dyn DataChannel>> {
        match label {
            None | Some(MAIN_CHANNEL) => self.main_channel.clone(),
            Some(label) => self.transfer_channels.get(label).cloned(),
        }
    }

    async fn send_data(
        &mut self,
        label: Option<String>,
        payload: ChannelPayload,
    ) -> Result<(), NegotiationError> {
        self.ensure_open("send data")?;
        let channel = self.channel(label.as_deref()).ok_or_else(|| {
            NegotiationError::UnknownChannel(label.unwrap_or_else(|| MAIN_CHANNEL.to_string()))
        })?;
        let sent = match payload {
            ChannelPayload::Text(text) => guarded(&mut self.closed, channel.send_text(&text)).await,
            ChannelPayload::Binary(data) => {
                guarded(&mut self.closed, channel.send_bytes(data)).await
            }
        };
        match sent {
            None => Err(NegotiationError::Closed),
            Some(result) => result.map_err(|err| NegotiationError::Send(err.to_string())),
        }
    }

    fn attach_channel(&mut self, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_string();
        let main = label == MAIN_CHANNEL;
        if main {
            self.main_channel = Some(channel);
        } else {
            self.transfer_channels.insert(label.clone(), channel);
        }
        tracing::debug!(
            target = "peer",
            peer_id = %self.peer_id,
            label = %label,
            main,
            "data channel attached"
        );
        self.emit(PeerEvent::DataChannel { label, main });
    }

    fn attach_track(&mut self, track: TrackInfo) {
        let replaced = match &mut self.inbound_stream {
            Some(stream) if stream.stream_id == track.stream_id => {
                stream.tracks.retain(|known| known.track_id != track.track_id);
                stream.tracks.push(track);
                return;
            }
            Some(_) => true,
            None => false,
        };
        let stream_id = track.stream_id.clone();
        self.inbound_stream = Some(InboundStream {
            stream_id: stream_id.clone(),
            tracks: vec![track],
        });
        self.emit(PeerEvent::StreamAttached {
            stream_id,
            replaced,
        });
    }

    fn handle_primitive(&mut self, event: PrimitiveEvent) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match event {
            PrimitiveEvent::IceCandidate(candidate) => {
                let _ = self.send(SignalBody::Candidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                });
            }
            PrimitiveEvent::IceConnectionState(state) => {
                if self.ice_state != state {
                    self.ice_state = state;
                    self.emit(PeerEvent::IceConnectionState(state));
                }
                match state {
                    IceConnectionState::Disconnected | IceConnectionState::Failed
                        if !self.state.is_terminal() =>
                    {
                        self.set_state(ConnectionState::Disconnected);
                    }
                    IceConnectionState::Connected | IceConnectionState::Completed
                        if self.state == ConnectionState::Disconnected =>
                    {
                        self.set_state(ConnectionState::Connected);
                    }
                    _ => {}
                }
            }
            PrimitiveEvent::SignalingState(state) => {
                self.update_signaling_state(state);
                self.maybe_connected();
            }
            PrimitiveEvent::DataChannel(channel) => self.attach_channel(channel),
            PrimitiveEvent::Track(track) => self.attach_track(track),
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        let message_type = message.type_name();
        let terminal = match self.state {
            ConnectionState::Closed => Some("session is closed"),
            ConnectionState::Failed => Some("session has failed"),
            _ => None,
        };
        match message.body {
            SignalBody::Offer { sdp } => {
                if let Some(reason) = terminal {
                    self.discard(message_type, reason);
                    return Ok(());
                }
                if self.state.round_in_flight() {
                    self.discard(message_type, "a negotiation round is already in flight");
                    return Ok(());
                }
                if self.pc.is_none() {
                    self.discard(message_type, "no peer connection");
                    return Ok(());
                }
                self.set_remote_description(SessionDescription::offer(sdp))
                    .await?;
                self.answer_round().await.map(|_| ())
            }
            SignalBody::Answer { sdp } => {
                if let Some(reason) = terminal {
                    self.discard(message_type, reason);
                    return Ok(());
                }
                if self.state != ConnectionState::Offering || self.remote_description.is_some() {
                    self.discard(message_type, "no offer is awaiting an answer");
                    return Ok(());
                }
                self.set_remote_description(SessionDescription::answer(sdp))
                    .await
            }
            SignalBody::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                if let Some(reason) = terminal {
                    self.discard(message_type, reason);
                    return Ok(());
                }
                self.add_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                })
                .await
            }
            SignalBody::Restart => {
                if self.state == ConnectionState::Closed || self.pc.is_none() {
                    self.discard(message_type, "session cannot renegotiate");
                    return Ok(());
                }
                self.restart().await.map(|_| ())
            }
            SignalBody::Bye => self.close().await,
            SignalBody::UserDataUpdate { user_data } => {
                self.metadata.update_user_data(&self.peer_id, user_data);
                Ok(())
            }
            SignalBody::MuteEvent { kind, muted } => {
                self.metadata.set_muted(&self.peer_id, kind, muted);
                Ok(())
            }
            _ => {
                tracing::debug!(
                    target = "peer",
                    peer_id = %self.peer_id,
                    message_type,
                    "ignoring room-level message"
                );
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut transfer_channels: Vec<String> = self.transfer_channels.keys().cloned().collect();
        transfer_channels.sort();
        SessionSnapshot {
            peer_id: self.peer_id.clone(),
            connection_state: self.state,
            signaling_state: self.signaling_state,
            ice_state: self.ice_state,
            local_description: self.local_description.clone(),
            remote_description: self.remote_description.clone(),
            pending_candidates: self.pending_candidates.len(),
            applying_candidates_immediately: self.apply_immediately,
            main_channel: self
                .main_channel
                .as_ref()
                .map(|channel| channel.label().to_string()),
            transfer_channels,
            inbound_stream: self.inbound_stream.clone(),
            local_stream: self.local_stream.clone(),
        }
    }
}

async fn next_primitive_event(
    events: &mut Option<mpsc::UnboundedReceiver<PrimitiveEvent>>,
) -> Option<PrimitiveEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Runs a primitive call unless the session closes first, in which case the
/// call is dropped and its late result never observed.
async fn guarded<T>(closed: &mut watch::Receiver<bool>, call: impl Future<Output = T>) -> Option<T> {
    if *closed.borrow() {
        return None;
    }
    tokio::select! {
        biased;
        _ = wait_closed(closed) => None,
        out = call => Some(out),
    }
}
