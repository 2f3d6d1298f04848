pub mod config;
pub mod dispatch;
pub mod error;
pub mod metadata;
pub mod peer;
pub mod protocol;
pub mod sdp;
pub mod signaling;
pub mod telemetry;

pub use config::RoomConfig;
pub use dispatch::{Dispatcher, Route};
pub use error::{ConfigError, DecodeError, NegotiationError, PrimitiveError, SignalingError};
pub use metadata::{InMemoryMetadataStore, MediaSettings, PeerMetadataStore};
pub use peer::{ConnectionState, PeerEvent, PeerSession, PeerSessionHandle, SessionEvent};
pub use protocol::{MediaKind, SignalBody, SignalMessage};
pub use signaling::{SignalSink, SignalingTransport, TransportEvent, TransportKind};
