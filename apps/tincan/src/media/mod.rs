use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IcePayload, SdpPayload};

pub mod capture;
pub mod mock;
pub mod webrtc;

pub use self::capture::SilentCapture;
pub use self::webrtc::{RtcSettings, WebRtcLinkFactory};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media setup failed: {0}")]
    Setup(String),
    #[error("local audio capture unavailable: {0}")]
    CaptureFailed(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("operation invalid in signaling sub-state {0:?}")]
    InvalidState(SignalingSubState),
    #[error("peer link closed")]
    Closed,
}

/// The media session's own negotiation phase, distinct from the
/// controller's session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingSubState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications emitted by a peer link after creation.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    LocalCandidate(IcePayload),
    RemoteTrack { id: String, kind: String },
    ConnectionState(LinkState),
}

/// One encoded audio frame from the local capture.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Boundary to local media acquisition. Implementations hand back a stream
/// of encoded frames; failure to start aborts the call attempt before any
/// signaling happens.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    fn label(&self) -> &str;
    async fn start(&self) -> Result<mpsc::Receiver<AudioFrame>, MediaError>;
}

/// The consumed contract of the underlying media stack. All mutating calls
/// suspend and must be issued one at a time per link; the negotiation
/// controller's single event loop is the serialization point.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SdpPayload, MediaError>;
    async fn create_answer(&self) -> Result<SdpPayload, MediaError>;
    async fn set_local_description(&self, description: SdpPayload) -> Result<(), MediaError>;
    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), MediaError>;
    async fn add_remote_candidate(&self, candidate: IcePayload) -> Result<(), MediaError>;
    fn signaling_state(&self) -> SignalingSubState;
    /// Event stream for this link; yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>>;
    async fn close(&self);
}

/// Builds a fresh peer link, acquiring local media in the process.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn MediaSession>, MediaError>;
}
