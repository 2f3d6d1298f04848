#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use room_rtc::error::{PrimitiveError, SignalingError};
use room_rtc::metadata::{InMemoryMetadataStore, MediaSettings};
use room_rtc::peer::{
    DataChannel, IceCandidate, LocalStream, MediaConstraints, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerSession, PeerSessionHandle, PrimitiveEvent, SdpType,
    SessionContext, SessionDescription, SessionEvent, SignalingState,
};
use room_rtc::protocol::SignalMessage;
use room_rtc::sdp::BandwidthCaps;
use room_rtc::signaling::{
    ConnectTarget, ConnectionIo, Connector, InboundFrame, SignalSink, SignalingEndpoint,
    TransportKind, TransportOptions,
};

pub const OFFER_SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 profile-level-id=42e01f\r\n";

pub const ANSWER_SDP: &str = "v=0\r\n\
o=- 3 4 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    CreateDataChannel(String),
    AddStream(String),
    Close,
}

/// Scripted peer connection: records every call, tracks the signaling state
/// the way a real stack would, and can fail or hold selected operations.
pub struct MockPeerConnection {
    calls: Mutex<Vec<Call>>,
    signaling: Mutex<SignalingState>,
    failing: Mutex<HashSet<&'static str>>,
    offer_gate: Mutex<Option<Arc<Notify>>>,
    pub offer_entered: Arc<Notify>,
}

impl MockPeerConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            signaling: Mutex::new(SignalingState::Stable),
            failing: Mutex::new(HashSet::new()),
            offer_gate: Mutex::new(None),
            offer_entered: Arc::new(Notify::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    /// Holds `create_offer` until the returned notify fires.
    pub fn gate_offer(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    fn record(&self, call: Call, op: &'static str) -> Result<(), PrimitiveError> {
        self.calls.lock().push(call);
        if self.failing.lock().contains(op) {
            return Err(PrimitiveError::Rejected(format!("{op} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PrimitiveError> {
        let gate = self.offer_gate.lock().take();
        if let Some(gate) = gate {
            self.offer_entered.notify_one();
            gate.notified().await;
        }
        self.record(Call::CreateOffer, "create_offer")?;
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError> {
        self.record(Call::CreateAnswer, "create_answer")?;
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PrimitiveError> {
        self.record(Call::SetLocal(desc.sdp_type), "set_local_description")?;
        *self.signaling.lock() = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            SdpType::Answer => SignalingState::Stable,
        };
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.record(Call::SetRemote(desc.sdp_type), "set_remote_description")?;
        *self.signaling.lock() = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            SdpType::Answer => SignalingState::Stable,
        };
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError> {
        self.record(Call::AddCandidate(candidate.candidate), "add_ice_candidate")
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, PrimitiveError> {
        self.record(Call::CreateDataChannel(label.to_string()), "create_data_channel")?;
        Ok(MockDataChannel::new(label))
    }

    async fn add_stream(&self, stream: &LocalStream) -> Result<(), PrimitiveError> {
        self.record(Call::AddStream(stream.id.clone()), "add_stream")
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        *self.signaling.lock() = SignalingState::Closed;
        self.record(Call::Close, "close")
    }
}

pub struct MockDataChannel {
    label: String,
    pub sent: Mutex<Vec<Bytes>>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), PrimitiveError> {
        self.sent.lock().push(Bytes::from(text.to_string()));
        Ok(())
    }

    async fn send_bytes(&self, data: Bytes) -> Result<(), PrimitiveError> {
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        Ok(())
    }
}

/// Hands out the shared mock and keeps the primitive event sender so tests
/// can raise callbacks.
pub struct MockFactory {
    pub pc: Arc<MockPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedSender<PrimitiveEvent>>>,
}

impl MockFactory {
    pub fn new(pc: Arc<MockPeerConnection>) -> Arc<Self> {
        Arc::new(Self {
            pc,
            events: Mutex::new(None),
        })
    }

    pub fn raise(&self, event: PrimitiveEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PrimitiveEvent>), PrimitiveError>
    {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        let pc: Arc<dyn PeerConnection> = self.pc.clone();
        Ok((pc, rx))
    }
}

/// Records every accepted message; while rejecting it refuses them the way
/// a disconnected transport does.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalMessage>>,
    rejecting: AtomicBool,
}

impl RecordingSink {
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.type_name()).collect()
    }
}

impl SignalSink for RecordingSink {
    fn send_signal(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

pub struct SessionHarness {
    pub handle: PeerSessionHandle,
    pub pc: Arc<MockPeerConnection>,
    pub factory: Arc<MockFactory>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<InMemoryMetadataStore>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHarness {
    pub fn spawn(peer_id: &str) -> Self {
        let pc = MockPeerConnection::new();
        let factory = MockFactory::new(Arc::clone(&pc));
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(InMemoryMetadataStore::new(MediaSettings {
            audio: true,
            video: true,
            stereo: true,
            bandwidth: BandwidthCaps {
                audio: Some(64),
                video: None,
                data: None,
            },
            strip_video_codec: Some("H264".to_string()),
        }));
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = PeerSession::spawn(SessionContext {
            peer_id: peer_id.to_string(),
            local_mid: "self".to_string(),
            room_id: "room-1".to_string(),
            factory: factory.clone(),
            signals: sink.clone(),
            metadata: store.clone(),
            events: events_tx,
        });
        Self {
            handle,
            pc,
            factory,
            sink,
            store,
            events,
        }
    }

    pub async fn connected(peer_id: &str) -> anyhow::Result<Self> {
        let harness = Self::spawn(peer_id);
        harness
            .handle
            .connect(MediaConstraints {
                audio: true,
                video: true,
            })
            .await?;
        Ok(harness)
    }

    /// Waits for the first event matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&PeerEvent) -> bool) -> PeerEvent {
        loop {
            let event = self.events.recv().await.expect("session event stream ended");
            if pred(&event.event) {
                return event.event;
            }
        }
    }

    /// Drains events that are already queued.
    pub fn drain_events(&mut self) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event.event);
        }
        out
    }
}

pub fn candidate(n: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Relay side of a connection opened through [`MockConnector`].
pub struct ServerLink {
    pub target: ConnectTarget,
    pub frames: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<InboundFrame>,
}

/// Connector whose attempts fail until `fail_first` is used up (or forever
/// when `always_fail`), recording every target it was asked for.
pub struct MockConnector {
    attempts: Mutex<Vec<ConnectTarget>>,
    fail_first: AtomicUsize,
    always_fail: bool,
    gate: Option<Arc<Notify>>,
    links: Mutex<VecDeque<ServerLink>>,
}

impl MockConnector {
    pub fn succeeding() -> Arc<Self> {
        Self::build(0, false, None)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(0, true, None)
    }

    pub fn failing_first(n: usize) -> Arc<Self> {
        Self::build(n, false, None)
    }

    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Self::build(0, false, Some(gate))
    }

    fn build(fail_first: usize, always_fail: bool, gate: Option<Arc<Notify>>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(fail_first),
            always_fail,
            gate,
            links: Mutex::new(VecDeque::new()),
        })
    }

    pub fn attempts(&self) -> Vec<ConnectTarget> {
        self.attempts.lock().clone()
    }

    pub fn take_link(&self) -> Option<ServerLink> {
        self.links.lock().pop_front()
    }

    pub async fn next_link(&self) -> ServerLink {
        loop {
            if let Some(link) = self.take_link() {
                return link;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<ConnectionIo, SignalingError> {
        self.attempts.lock().push(target.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let scripted_failure = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.always_fail || scripted_failure {
            return Err(SignalingError::Connect {
                kind: target.kind,
                target: target.url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.links.lock().push_back(ServerLink {
            target: target.clone(),
            frames: outbound_rx,
            inbound: inbound_tx,
        });
        Ok(ConnectionIo {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: Vec::new(),
        })
    }
}

pub fn transport_options(ports: &[u16]) -> TransportOptions {
    TransportOptions {
        endpoint: SignalingEndpoint {
            host: "relay.test".to_string(),
            path: "signaling".to_string(),
            secure: false,
            secure_ports: vec![443],
            insecure_ports: ports.to_vec(),
        },
        connect_timeout: Duration::from_secs(5),
        max_reconnect_attempts: None,
        preferred: TransportKind::Primary,
        flush_interval: Duration::from_millis(1000),
        throughput_cap: 16,
    }
}
