use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    IceCandidate, IceConnectionState, LocalStream, MediaConstraints, SessionDescription,
    SignalingState, TrackInfo,
};
use crate::error::PrimitiveError;

/// The peer-connection capability a session negotiates on. ICE gathering,
/// media encoding and NAT traversal all live behind it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PrimitiveError>;
    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PrimitiveError>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), PrimitiveError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError>;
    async fn create_data_channel(&self, label: &str)
    -> Result<Arc<dyn DataChannel>, PrimitiveError>;
    async fn add_stream(&self, stream: &LocalStream) -> Result<(), PrimitiveError>;
    fn signaling_state(&self) -> SignalingState;
    async fn close(&self) -> Result<(), PrimitiveError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    async fn send_text(&self, text: &str) -> Result<(), PrimitiveError>;
    async fn send_bytes(&self, data: Bytes) -> Result<(), PrimitiveError>;
    async fn close(&self) -> Result<(), PrimitiveError>;
}

/// Callbacks raised by the primitive outside of any request.
pub enum PrimitiveEvent {
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    SignalingState(SignalingState),
    DataChannel(Arc<dyn DataChannel>),
    Track(TrackInfo),
}

impl std::fmt::Debug for PrimitiveEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            PrimitiveEvent::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
            PrimitiveEvent::SignalingState(state) => {
                f.debug_tuple("SignalingState").field(state).finish()
            }
            PrimitiveEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PrimitiveEvent::Track(track) => f.debug_tuple("Track").field(track).finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PrimitiveEvent>), PrimitiveError>;
}
