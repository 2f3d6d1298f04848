use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use room_rtc::config::RoomConfig;
use room_rtc::peer::rtc::RtcPeerConnectionFactory;
use room_rtc::peer::{
    MediaConstraints, PeerConnectionFactory, PeerSession, PeerSessionHandle, SessionContext,
};
use room_rtc::signaling::{ConnectErrorCode, DefaultConnector};
use room_rtc::telemetry::init_tracing;
use room_rtc::{
    ConnectionState, Dispatcher, InMemoryMetadataStore, NegotiationError, PeerEvent,
    PeerMetadataStore, SessionEvent, SignalBody, SignalMessage, SignalingTransport,
    TransportEvent,
};

#[derive(Parser, Debug)]
#[command(name = "room-rtc", about = "Join a signaling room and negotiate with its peers")]
struct Cli {
    #[arg(long, env = "ROOM_RTC_ROOM")]
    room: String,

    #[arg(long, short = 'c', help = "TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, short = 'u', help = "Display name announced to the room")]
    user: Option<String>,

    #[arg(long, help = "Local session id; random when omitted")]
    mid: Option<String>,
}

struct Room {
    mid: String,
    rid: String,
    user_info: Value,
    constraints: MediaConstraints,
    transport: Arc<SignalingTransport>,
    dispatcher: Dispatcher,
    factory: Arc<dyn PeerConnectionFactory>,
    metadata: Arc<InMemoryMetadataStore>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
}

impl Room {
    fn send(&self, body: SignalBody, target: Option<&str>) {
        let mut message = SignalMessage::new(&self.mid, &self.rid, body);
        if let Some(target) = target {
            message = message.with_target(target);
        }
        let message_type = message.type_name();
        if let Err(err) = self.transport.send(message) {
            tracing::warn!(target = "signaling", message_type, "room message not sent: {err}");
        }
    }

    async fn session(&self, peer_id: &str) -> Result<PeerSessionHandle, NegotiationError> {
        if let Some(handle) = self.dispatcher.session(peer_id) {
            return Ok(handle);
        }
        let handle = PeerSession::spawn(SessionContext {
            peer_id: peer_id.to_string(),
            local_mid: self.mid.clone(),
            room_id: self.rid.clone(),
            factory: Arc::clone(&self.factory),
            signals: self.transport.clone(),
            metadata: self.metadata.clone(),
            events: self.session_events.clone(),
        });
        self.dispatcher.register(handle.clone());
        handle.connect(self.constraints).await?;
        Ok(handle)
    }

    async fn drop_peer(&self, peer_id: &str) {
        if let Some(handle) = self.dispatcher.remove(peer_id) {
            let _ = handle.disconnect().await;
        }
        self.metadata.remove(peer_id);
    }

    async fn on_room_message(&self, message: SignalMessage) -> Result<(), NegotiationError> {
        let peer_id = message.mid.clone();
        match &message.body {
            SignalBody::Enter { user_info } => {
                tracing::info!(target = "peer", peer_id = %peer_id, "peer entered");
                self.metadata.update_user_data(&peer_id, user_info.clone());
                self.send(
                    SignalBody::Welcome {
                        user_info: self.user_info.clone(),
                    },
                    Some(&peer_id),
                );
                // the newcomer offers once it sees our welcome
                self.session(&peer_id).await?;
            }
            SignalBody::Welcome { user_info } => {
                self.metadata.update_user_data(&peer_id, user_info.clone());
                let handle = self.session(&peer_id).await?;
                handle.create_data_channel(None).await?;
                handle.create_offer().await?;
            }
            SignalBody::Offer { .. } | SignalBody::Candidate { .. } => {
                let handle = self.session(&peer_id).await?;
                handle.deliver(message.clone())?;
            }
            SignalBody::Bye => {
                tracing::info!(target = "peer", peer_id = %peer_id, "peer left");
                self.drop_peer(&peer_id).await;
            }
            SignalBody::RoomLockEvent { lock } => {
                tracing::info!(target = "signaling", locked = *lock, "room lock changed");
            }
            SignalBody::PublicMessage { data } => {
                tracing::info!(target = "signaling", from = %peer_id, %data, "room message");
            }
            _ => {
                tracing::debug!(
                    target = "signaling",
                    message_type = message.type_name(),
                    from = %peer_id,
                    "unhandled room message"
                );
            }
        }
        Ok(())
    }

    async fn leave(&self) {
        self.send(SignalBody::Bye, None);
        for peer_id in self.dispatcher.peers() {
            self.drop_peer(&peer_id).await;
        }
        self.transport.disconnect();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RoomConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.log_filter);

    let mid = cli
        .mid
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let connector = Arc::new(DefaultConnector::new(config.poll_interval()));
    let transport = SignalingTransport::new(config.transport_options(), connector);
    let mut transport_events = transport
        .events()
        .context("transport event stream already taken")?;
    let (dispatcher, mut room_rx) = Dispatcher::new(mid.clone());
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();

    let room = Room {
        mid: mid.clone(),
        rid: cli.room.clone(),
        user_info: json!({ "name": cli.user.unwrap_or_else(|| mid.clone()) }),
        constraints: MediaConstraints {
            audio: config.media.audio,
            video: config.media.video,
        },
        transport: Arc::clone(&transport),
        dispatcher,
        factory: Arc::new(RtcPeerConnectionFactory::new(config.ice_servers.clone())),
        metadata: Arc::new(InMemoryMetadataStore::new(config.media.settings())),
        session_events: session_tx,
    };

    tracing::info!(target = "signaling", mid = %mid, room = %cli.room, "joining room");
    transport
        .connect()
        .await
        .context("connecting to signaling relay")?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(target = "signaling", "shutting down");
                break;
            }
            Some(event) = transport_events.recv() => match event {
                TransportEvent::Connect { kind, target } => {
                    tracing::info!(target = "signaling", ?kind, url = %target, "entering room");
                    room.send(SignalBody::Enter { user_info: room.user_info.clone() }, None);
                }
                TransportEvent::Message(message) => {
                    room.dispatcher.dispatch(message);
                }
                TransportEvent::ConnectError { code: ConnectErrorCode::Exhausted, error, .. } => {
                    room.leave().await;
                    bail!("signaling relay unreachable: {error}");
                }
                other => {
                    tracing::debug!(target = "signaling", event = ?other, "transport event");
                }
            },
            Some(message) = room_rx.recv() => {
                if let Err(err) = room.on_room_message(message).await {
                    tracing::warn!(target = "peer", "room message failed: {err}");
                }
            }
            Some(SessionEvent { peer_id, event }) = session_rx.recv() => {
                tracing::info!(target = "peer", peer_id = %peer_id, event = event.name());
                if event == PeerEvent::ConnectionState(ConnectionState::Closed) {
                    room.dispatcher.remove(&peer_id);
                }
            }
        }
    }

    room.leave().await;
    Ok(())
}
