use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::peer::PeerEvent;
use crate::protocol::MediaKind;
use crate::sdp::BandwidthCaps;

/// Media capability flags that shape locally generated descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSettings {
    pub audio: bool,
    pub video: bool,
    pub stereo: bool,
    pub bandwidth: BandwidthCaps,
    pub strip_video_codec: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerRecord {
    pub user_data: Value,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub settings: Option<MediaSettings>,
    pub last_event: Option<String>,
}

/// Boundary to the peer bookkeeping that lives outside the negotiation core.
pub trait PeerMetadataStore: Send + Sync {
    /// Settings used for descriptions generated towards `peer_id`.
    fn media_settings(&self, peer_id: &str) -> MediaSettings;
    fn update_user_data(&self, peer_id: &str, user_data: Value);
    fn set_muted(&self, peer_id: &str, kind: MediaKind, muted: bool);
    fn negotiation_event(&self, peer_id: &str, event: &PeerEvent);
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    defaults: MediaSettings,
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new(defaults: MediaSettings) -> Self {
        Self {
            defaults,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_media_settings(&self, peer_id: &str, settings: MediaSettings) {
        self.peers
            .write()
            .entry(peer_id.to_string())
            .or_default()
            .settings = Some(settings);
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.write().remove(peer_id)
    }
}

impl PeerMetadataStore for InMemoryMetadataStore {
    fn media_settings(&self, peer_id: &str) -> MediaSettings {
        self.peers
            .read()
            .get(peer_id)
            .and_then(|record| record.settings.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    fn update_user_data(&self, peer_id: &str, user_data: Value) {
        self.peers
            .write()
            .entry(peer_id.to_string())
            .or_default()
            .user_data = user_data;
    }

    fn set_muted(&self, peer_id: &str, kind: MediaKind, muted: bool) {
        let mut peers = self.peers.write();
        let record = peers.entry(peer_id.to_string()).or_default();
        match kind {
            MediaKind::Audio => record.audio_muted = muted,
            MediaKind::Video => record.video_muted = muted,
        }
    }

    fn negotiation_event(&self, peer_id: &str, event: &PeerEvent) {
        if let Some(record) = self.peers.write().get_mut(peer_id) {
            record.last_event = Some(event.name().to_string());
        }
    }
}
