use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    LinkState, MediaError, MediaEvent, MediaSession, PeerLinkFactory, SignalingSubState,
};
use crate::protocol::{IcePayload, SdpKind, SdpPayload};

/// Scripted peer link: produces deterministic descriptions, enforces the
/// signaling sub-state preconditions a real media stack would, and records
/// every operation for assertions.
#[derive(Clone)]
pub struct MockLink {
    inner: Arc<MockLinkInner>,
}

struct MockLinkInner {
    tag: String,
    state: Mutex<SignalingSubState>,
    ops: Mutex<Vec<String>>,
    remote_described: AtomicBool,
    reject_candidates: AtomicBool,
    require_remote_description: AtomicBool,
    trickle_on_local: usize,
    close_count: Mutex<usize>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
}

impl MockLink {
    pub fn new(tag: impl Into<String>) -> Self {
        Self::with_trickle(tag, 2)
    }

    pub fn with_trickle(tag: impl Into<String>, trickle_on_local: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockLinkInner {
                tag: tag.into(),
                state: Mutex::new(SignalingSubState::Stable),
                ops: Mutex::new(Vec::new()),
                remote_described: AtomicBool::new(false),
                reject_candidates: AtomicBool::new(false),
                require_remote_description: AtomicBool::new(true),
                trickle_on_local,
                close_count: Mutex::new(0),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn set_reject_candidates(&self, reject: bool) {
        self.inner.reject_candidates.store(reject, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<String> {
        self.inner.ops.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        *self.inner.close_count.lock()
    }

    pub fn candidates_added(&self) -> usize {
        self.inner
            .ops
            .lock()
            .iter()
            .filter(|op| op.starts_with("add_candidate"))
            .count()
    }

    fn record(&self, op: String) {
        self.inner.ops.lock().push(op);
    }

    fn trickle(&self) {
        for index in 0..self.inner.trickle_on_local {
            let payload = IcePayload {
                candidate: format!("candidate:{}-{index}", self.inner.tag),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            };
            let _ = self
                .inner
                .events_tx
                .send(MediaEvent::LocalCandidate(payload));
        }
    }
}

#[async_trait]
impl MediaSession for MockLink {
    async fn create_offer(&self) -> Result<SdpPayload, MediaError> {
        self.record("create_offer".into());
        Ok(SdpPayload::offer(format!("v=0 offer from {}", self.inner.tag)))
    }

    async fn create_answer(&self) -> Result<SdpPayload, MediaError> {
        let state = *self.inner.state.lock();
        if state != SignalingSubState::HaveRemoteOffer {
            return Err(MediaError::InvalidState(state));
        }
        self.record("create_answer".into());
        Ok(SdpPayload::answer(format!(
            "v=0 answer from {}",
            self.inner.tag
        )))
    }

    async fn set_local_description(&self, description: SdpPayload) -> Result<(), MediaError> {
        let mut state = self.inner.state.lock();
        match description.kind {
            SdpKind::Offer => {
                if *state != SignalingSubState::Stable {
                    return Err(MediaError::InvalidState(*state));
                }
                *state = SignalingSubState::HaveLocalOffer;
            }
            SdpKind::Answer => {
                if *state != SignalingSubState::HaveRemoteOffer {
                    return Err(MediaError::InvalidState(*state));
                }
                *state = SignalingSubState::Stable;
            }
        }
        drop(state);
        self.record(format!("set_local {}", description.kind));
        self.trickle();
        if description.kind == SdpKind::Answer {
            let _ = self
                .inner
                .events_tx
                .send(MediaEvent::ConnectionState(LinkState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), MediaError> {
        let mut state = self.inner.state.lock();
        match description.kind {
            SdpKind::Offer => {
                if *state != SignalingSubState::Stable {
                    return Err(MediaError::InvalidState(*state));
                }
                *state = SignalingSubState::HaveRemoteOffer;
            }
            SdpKind::Answer => {
                if *state != SignalingSubState::HaveLocalOffer {
                    return Err(MediaError::InvalidState(*state));
                }
                *state = SignalingSubState::Stable;
            }
        }
        drop(state);
        self.inner.remote_described.store(true, Ordering::SeqCst);
        self.record(format!("set_remote {}", description.kind));
        if description.kind == SdpKind::Answer {
            let _ = self
                .inner
                .events_tx
                .send(MediaEvent::ConnectionState(LinkState::Connected));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IcePayload) -> Result<(), MediaError> {
        if self.inner.reject_candidates.load(Ordering::SeqCst) {
            return Err(MediaError::InvalidCandidate(candidate.candidate));
        }
        if self.inner.require_remote_description.load(Ordering::SeqCst)
            && !self.inner.remote_described.load(Ordering::SeqCst)
        {
            return Err(MediaError::InvalidCandidate(
                "no remote description".into(),
            ));
        }
        self.record(format!("add_candidate {}", candidate.candidate));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingSubState {
        *self.inner.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.inner.events_rx.lock().take()
    }

    async fn close(&self) {
        *self.inner.state.lock() = SignalingSubState::Closed;
        *self.inner.close_count.lock() += 1;
    }
}

/// Factory that hands out `MockLink`s and keeps a handle to each one for
/// later inspection.
pub struct MockLinkFactory {
    tag: String,
    trickle_on_local: usize,
    fail_next: AtomicBool,
    created: Mutex<Vec<MockLink>>,
}

impl MockLinkFactory {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            trickle_on_local: 2,
            fail_next: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<MockLink> {
        self.created.lock().clone()
    }

    pub fn link(&self, index: usize) -> MockLink {
        self.created.lock()[index].clone()
    }
}

#[async_trait]
impl PeerLinkFactory for MockLinkFactory {
    async fn create(&self) -> Result<Box<dyn MediaSession>, MediaError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MediaError::CaptureFailed("no capture device".into()));
        }
        let mut created = self.created.lock();
        let tag = format!("{}-{}", self.tag, created.len());
        let link = MockLink::with_trickle(tag, self.trickle_on_local);
        created.push(link.clone());
        Ok(Box::new(link.clone()))
    }
}
