use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::peer::PeerSessionHandle;
use crate::protocol::{SignalBody, SignalMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Delivered to the session registered for this peer id.
    Session(String),
    /// Handed to the room channel for the orchestrator.
    Room,
    Ignored,
}

/// Routes inbound signaling messages to peer sessions by sender id.
/// Group envelopes are unpacked in order before routing.
pub struct Dispatcher {
    local_mid: String,
    sessions: RwLock<HashMap<String, PeerSessionHandle>>,
    room_tx: mpsc::UnboundedSender<SignalMessage>,
}

impl Dispatcher {
    pub fn new(local_mid: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let (room_tx, room_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            local_mid: local_mid.into(),
            sessions: RwLock::new(HashMap::new()),
            room_tx,
        };
        (dispatcher, room_rx)
    }

    pub fn register(&self, handle: PeerSessionHandle) -> Option<PeerSessionHandle> {
        self.sessions
            .write()
            .insert(handle.peer_id().to_string(), handle)
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerSessionHandle> {
        self.sessions.write().remove(peer_id)
    }

    pub fn session(&self, peer_id: &str) -> Option<PeerSessionHandle> {
        self.sessions.read().get(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn dispatch(&self, message: SignalMessage) -> Vec<Route> {
        message
            .into_flat()
            .into_iter()
            .map(|message| self.route(message))
            .collect()
    }

    fn route(&self, message: SignalMessage) -> Route {
        if message.mid == self.local_mid {
            return Route::Ignored;
        }
        if message
            .target
            .as_deref()
            .is_some_and(|target| target != self.local_mid)
        {
            return Route::Ignored;
        }
        let room_level = matches!(
            message.body,
            SignalBody::Enter { .. }
                | SignalBody::Welcome { .. }
                | SignalBody::Bye
                | SignalBody::RoomLockEvent { .. }
                | SignalBody::PublicMessage { .. }
        );
        if !room_level {
            if let Some(handle) = self.session(&message.mid) {
                let peer_id = message.mid.clone();
                return match handle.deliver(message) {
                    Ok(()) => Route::Session(peer_id),
                    Err(_) => {
                        tracing::debug!(
                            target = "signaling",
                            peer_id = %peer_id,
                            "session gone; dropping message"
                        );
                        self.remove(&peer_id);
                        Route::Ignored
                    }
                };
            }
        }
        let message_type = message.type_name();
        match self.room_tx.send(message) {
            Ok(()) => Route::Room,
            Err(_) => {
                tracing::debug!(target = "signaling", message_type, "room channel closed");
                Route::Ignored
            }
        }
    }
}
