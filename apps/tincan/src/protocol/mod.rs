use std::fmt;

use serde::{Deserialize, Serialize};

/// Session description half being exchanged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// A session description exactly as produced by the media session handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SdpPayload {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered candidate network path, relayed opaquely between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IcePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Body of a `signal` envelope: either half of the SDP exchange or one
/// trickled candidate. Discriminated by its single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SignalPayload {
    Sdp { sdp: SdpPayload },
    Ice { ice: IcePayload },
}

/// Wire envelope exchanged with the relay. `waiting`, `matched` and `error`
/// originate at the relay; `signal` and `call_end` are relayed verbatim
/// between the paired peers. Unrecognized types deserialize to `Unknown`
/// and are dropped by the receiver rather than failing the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalEnvelope {
    Waiting,
    Matched { partner: String, initiator: bool },
    Signal(SignalPayload),
    CallEnd { reason: String },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl SignalEnvelope {
    pub fn sdp(payload: SdpPayload) -> Self {
        SignalEnvelope::Signal(SignalPayload::Sdp { sdp: payload })
    }

    pub fn ice(payload: IcePayload) -> Self {
        SignalEnvelope::Signal(SignalPayload::Ice { ice: payload })
    }

    pub fn call_end(reason: impl Into<String>) -> Self {
        SignalEnvelope::CallEnd {
            reason: reason.into(),
        }
    }

    /// Compact description for the session log. Never includes SDP blobs.
    pub fn summary(&self) -> String {
        match self {
            SignalEnvelope::Waiting => "waiting".into(),
            SignalEnvelope::Matched { partner, initiator } => {
                format!("matched partner={partner} initiator={initiator}")
            }
            SignalEnvelope::Signal(SignalPayload::Sdp { sdp }) => {
                format!("signal sdp {} ({} bytes)", sdp.kind, sdp.sdp.len())
            }
            SignalEnvelope::Signal(SignalPayload::Ice { ice }) => {
                format!("signal ice ({} bytes)", ice.candidate.len())
            }
            SignalEnvelope::CallEnd { reason } => format!("call_end reason={reason}"),
            SignalEnvelope::Error { message } => format!("error message={message}"),
            SignalEnvelope::Unknown => "unknown".into(),
        }
    }
}
