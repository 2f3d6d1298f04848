//! [`PeerConnection`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::connection::{DataChannel, PeerConnection, PeerConnectionFactory, PrimitiveEvent};
use super::{
    IceCandidate, IceConnectionState, LocalStream, MediaConstraints, SdpType, SessionDescription,
    SignalingState, TrackInfo,
};
use crate::error::PrimitiveError;
use crate::protocol::MediaKind;

fn build_api() -> Result<API, PrimitiveError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct RtcPeerConnectionFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        if self.ice_servers.is_empty() {
            return RTCConfiguration::default();
        }
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PrimitiveEvent>), PrimitiveError>
    {
        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(self.configuration()).await?);
        if constraints.audio {
            pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await?;
        }
        if constraints.video {
            pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        register_handlers(&pc, events_tx);
        tracing::debug!(
            target = "peer",
            audio = constraints.audio,
            video = constraints.video,
            "webrtc peer connection created"
        );
        Ok((Arc::new(RtcPeerConnection { pc }), events_rx))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PrimitiveEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PrimitiveEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => {
                    tracing::warn!(target = "peer", "failed to serialize local candidate: {err}");
                }
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = ice_state(state) {
                let _ = tx.send(PrimitiveEvent::IceConnectionState(state));
            }
        })
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = signaling_state(state) {
                let _ = tx.send(PrimitiveEvent::SignalingState(state));
            }
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "peer", label = dc.label(), "remote data channel announced");
            let _ = tx.send(PrimitiveEvent::DataChannel(Arc::new(RtcDataChannel { dc })));
        })
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let _ = tx.send(PrimitiveEvent::Track(TrackInfo {
                stream_id: track.stream_id(),
                track_id: track.id(),
                kind,
            }));
        })
    }));
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalAnswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemoteAnswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified => return None,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PrimitiveError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PrimitiveError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PrimitiveError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, PrimitiveError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(Arc::new(RtcDataChannel { dc }))
    }

    async fn add_stream(&self, stream: &LocalStream) -> Result<(), PrimitiveError> {
        let mut tracks = Vec::new();
        if stream.audio {
            tracks.push((MIME_TYPE_OPUS, format!("{}-audio", stream.id)));
        }
        if stream.video {
            tracks.push((MIME_TYPE_VP8, format!("{}-video", stream.id)));
        }
        for (mime_type, track_id) in tracks {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track_id,
                stream.id.clone(),
            ));
            self.pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state()).unwrap_or(SignalingState::Stable)
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send_text(&self, text: &str) -> Result<(), PrimitiveError> {
        self.dc.send_text(text.to_owned()).await?;
        Ok(())
    }

    async fn send_bytes(&self, data: Bytes) -> Result<(), PrimitiveError> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        self.dc.close().await?;
        Ok(())
    }
}
