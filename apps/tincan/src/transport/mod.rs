use thiserror::Error;

use crate::protocol::SignalEnvelope;

pub mod mock;
pub mod websocket;

pub use self::websocket::RelayChannel;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("timed out waiting for signaling traffic")]
    Timeout,
}

/// Inbound side of the signaling connection. `Closed` is terminal: no
/// further events arrive after it.
#[derive(Debug)]
pub enum ChannelEvent {
    Envelope(SignalEnvelope),
    Closed { reason: String },
}

/// Outbound half of the relay connection. Sends are fire-and-forget: the
/// envelope is enqueued for transmission and `ChannelClosed` is the only
/// failure once the underlying connection is gone.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError>;
    fn close(&self);
}
