use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    AudioCapture, LinkState, MediaError, MediaEvent, MediaSession, PeerLinkFactory,
    SignalingSubState,
};
use crate::protocol::{IcePayload, SdpKind, SdpPayload};

#[derive(Debug, Clone)]
pub struct RtcSettings {
    pub stun_servers: Vec<String>,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
        }
    }
}

impl RtcSettings {
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect()
    }
}

pub struct WebRtcLinkFactory {
    settings: RtcSettings,
    capture: Arc<dyn AudioCapture>,
}

impl WebRtcLinkFactory {
    pub fn new(settings: RtcSettings, capture: Arc<dyn AudioCapture>) -> Self {
        Self { settings, capture }
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create(&self) -> Result<Box<dyn MediaSession>, MediaError> {
        let link = WebRtcLink::open(&self.settings, Arc::clone(&self.capture)).await?;
        Ok(Box::new(link))
    }
}

fn build_api(setting: SettingEngine) -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> MediaError {
    MediaError::Setup(err.to_string())
}

/// Peer link backed by the `webrtc` crate: one audio track fed by the
/// injected capture, trickled candidates and remote tracks surfaced as
/// `MediaEvent`s.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebRtcLink {
    pub async fn open(
        settings: &RtcSettings,
        capture: Arc<dyn AudioCapture>,
    ) -> Result<Self, MediaError> {
        let mut frames = capture.start().await?;
        tracing::debug!(target = "media", source = capture.label(), "local audio acquired");

        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let config = RTCConfiguration {
            ice_servers: settings.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_setup_error)?);

        let (events_tx, events_rx) = mpsc::unbounded_channel::<MediaEvent>();

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "tincan".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;

        let rtcp_handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let pump_handle = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let sample = Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    break;
                }
            }
        });

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target = "media", "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let payload = IcePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        let _ = tx.send(MediaEvent::LocalCandidate(payload));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "media",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let track_tx = events_tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let _ = tx.send(MediaEvent::RemoteTrack {
                    id: track.id(),
                    kind: track.kind().to_string(),
                });
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                });
            })
        }));

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let _ = tx.send(MediaEvent::ConnectionState(map_connection_state(state)));
            })
        }));

        Ok(Self {
            pc,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![rtcp_handle, pump_handle]),
        })
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn description_to_payload(description: &RTCSessionDescription) -> Result<SdpPayload, MediaError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(MediaError::Setup(format!("unsupported sdp type {other}")));
        }
    };
    Ok(SdpPayload {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn description_from_payload(payload: &SdpPayload) -> Result<RTCSessionDescription, MediaError> {
    match payload.kind {
        SdpKind::Offer => RTCSessionDescription::offer(payload.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(payload.sdp.clone()),
    }
    .map_err(to_setup_error)
}

#[async_trait]
impl MediaSession for WebRtcLink {
    async fn create_offer(&self) -> Result<SdpPayload, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        description_to_payload(&offer)
    }

    async fn create_answer(&self) -> Result<SdpPayload, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        description_to_payload(&answer)
    }

    async fn set_local_description(&self, description: SdpPayload) -> Result<(), MediaError> {
        let description = description_from_payload(&description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), MediaError> {
        let description = description_from_payload(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn add_remote_candidate(&self, candidate: IcePayload) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| MediaError::InvalidCandidate(err.to_string()))
    }

    fn signaling_state(&self) -> SignalingSubState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingSubState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingSubState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingSubState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingSubState::Closed,
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "media", error = %err, "peer connection close failed");
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
