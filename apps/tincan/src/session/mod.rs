use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::media::{MediaError, MediaEvent, MediaSession, PeerLinkFactory, SignalingSubState};
use crate::protocol::{IcePayload, SdpKind, SdpPayload, SignalEnvelope, SignalPayload};
use crate::transport::{ChannelEvent, SignalingChannel};

pub mod log;

use self::log::SessionLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingMatch,
    Negotiating,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),
}

/// Bounded waits for the two server-driven phases. Hitting either deadline
/// ends the session with reason `negotiation_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub match_wait: Duration,
    pub negotiation: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            match_wait: Duration::from_secs(90),
            negotiation: Duration::from_secs(30),
        }
    }
}

enum LoopEvent {
    Channel(ChannelEvent),
    Media { generation: u64, event: MediaEvent },
    HangUp { reason: String },
}

struct ActiveSession {
    id: Uuid,
    role: CallRole,
    partner: String,
    link: Box<dyn MediaSession>,
    generation: u64,
    offer_sent: bool,
    remote_described: bool,
    pending_candidates: Vec<IcePayload>,
}

/// Handle to a running call attempt. Dropping it does not end the call;
/// `hang_up` does.
pub struct CallHandle {
    commands: mpsc::UnboundedSender<LoopEvent>,
    states: watch::Receiver<SessionState>,
    task: tokio::task::JoinHandle<SessionState>,
}

impl CallHandle {
    pub fn hang_up(&self, reason: impl Into<String>) {
        let _ = self.commands.send(LoopEvent::HangUp {
            reason: reason.into(),
        });
    }

    pub fn state(&self) -> SessionState {
        *self.states.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.states.clone()
    }

    pub async fn join(self) -> SessionState {
        self.task.await.unwrap_or(SessionState::Ended)
    }
}

/// The per-call state machine. Owns the only mutable session state; relay
/// envelopes, media events and local commands all arrive through one
/// ordered queue consumed by a single task, so media mutations are issued
/// strictly one at a time.
pub struct NegotiationController {
    channel: Arc<dyn SignalingChannel>,
    links: Arc<dyn PeerLinkFactory>,
    log: SessionLog,
    timeouts: SessionTimeouts,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    state_tx: watch::Sender<SessionState>,
    state: SessionState,
    session: Option<ActiveSession>,
    spare_link: Option<Box<dyn MediaSession>>,
    generation_counter: u64,
    deadline: Option<Instant>,
}

impl NegotiationController {
    /// Acquires local media (failure here aborts before any signaling),
    /// enters `AwaitingMatch`, and spawns the event loop. Construct once
    /// per call attempt.
    pub async fn launch(
        channel: Arc<dyn SignalingChannel>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        links: Arc<dyn PeerLinkFactory>,
        log: SessionLog,
        timeouts: SessionTimeouts,
    ) -> Result<CallHandle, SessionError> {
        let spare_link = links.create().await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let forward_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = channel_events.recv().await {
                if forward_tx.send(LoopEvent::Channel(event)).is_err() {
                    break;
                }
            }
        });

        let mut controller = NegotiationController {
            channel,
            links,
            log,
            timeouts,
            events_rx,
            events_tx: events_tx.clone(),
            state_tx,
            state: SessionState::Idle,
            session: None,
            spare_link: Some(spare_link),
            generation_counter: 0,
            deadline: None,
        };
        controller.set_state(SessionState::AwaitingMatch);
        controller.deadline = Some(Instant::now() + controller.timeouts.match_wait);
        controller.log.status("awaiting a partner from the relay");

        let task = tokio::spawn(controller.run());
        Ok(CallHandle {
            commands: events_tx,
            states: state_rx,
            task,
        })
    }

    async fn run(mut self) -> SessionState {
        loop {
            let event = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                        Ok(event) => event,
                        Err(_) => {
                            self.on_deadline().await;
                            if self.state == SessionState::Ended {
                                break;
                            }
                            continue;
                        }
                    }
                }
                None => self.events_rx.recv().await,
            };
            let Some(event) = event else {
                self.end_session("event_sources_closed", false).await;
                break;
            };
            self.handle(event).await;
            if self.state == SessionState::Ended {
                break;
            }
        }
        self.state
    }

    async fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Channel(ChannelEvent::Envelope(envelope)) => {
                self.on_envelope(envelope).await;
            }
            LoopEvent::Channel(ChannelEvent::Closed { reason }) => {
                self.log.error(format!("signaling channel closed: {reason}"));
                self.end_session("channel_closed", false).await;
            }
            LoopEvent::Media { generation, event } => {
                self.on_media(generation, event).await;
            }
            LoopEvent::HangUp { reason } => {
                self.end_session(&reason, true).await;
            }
        }
    }

    async fn on_envelope(&mut self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::Waiting => {
                self.log.status("waiting for a partner");
            }
            SignalEnvelope::Matched { partner, initiator } => {
                self.on_matched(partner, initiator).await;
            }
            SignalEnvelope::Signal(SignalPayload::Sdp { sdp }) => match sdp.kind {
                SdpKind::Offer => self.on_offer(sdp).await,
                SdpKind::Answer => self.on_answer(sdp).await,
            },
            SignalEnvelope::Signal(SignalPayload::Ice { ice }) => {
                self.on_remote_candidate(ice).await;
            }
            SignalEnvelope::CallEnd { reason } => {
                self.log.status(format!("partner ended the call: {reason}"));
                self.end_session(&reason, false).await;
            }
            SignalEnvelope::Error { message } => {
                self.log.error(format!("relay error: {message}"));
            }
            SignalEnvelope::Unknown => {
                self.log.ignored("unrecognized envelope type");
            }
        }
    }

    async fn on_matched(&mut self, partner: String, initiator: bool) {
        if self.session.is_some() {
            self.log.error(
                "matched again while a session is active; tearing down the previous session",
            );
            if let Some(previous) = self.session.take() {
                previous.link.close().await;
            }
        }

        let link = match self.spare_link.take() {
            Some(link) => link,
            None => match self.links.create().await {
                Ok(link) => link,
                Err(err) => {
                    self.log.error(format!("failed to create a peer link: {err}"));
                    self.end_session("media_unavailable", true).await;
                    return;
                }
            },
        };

        self.generation_counter += 1;
        let generation = self.generation_counter;
        if let Some(mut media_events) = link.take_events() {
            let media_tx = self.events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = media_events.recv().await {
                    if media_tx
                        .send(LoopEvent::Media { generation, event })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let role = if initiator {
            CallRole::Initiator
        } else {
            CallRole::Responder
        };
        let session = ActiveSession {
            id: Uuid::new_v4(),
            role,
            partner: partner.clone(),
            link,
            generation,
            offer_sent: false,
            remote_described: false,
            pending_candidates: Vec::new(),
        };
        let attempt = session.id;
        self.session = Some(session);
        self.set_state(SessionState::Negotiating);
        self.deadline = Some(Instant::now() + self.timeouts.negotiation);
        self.log.status(format!(
            "matched with {partner}; negotiating as {} (attempt {attempt})",
            if initiator { "initiator" } else { "responder" }
        ));

        if initiator {
            self.send_local_offer().await;
        }
    }

    async fn send_local_offer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let offer = match session.link.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.log.error(format!("offer creation failed: {err}"));
                self.end_session("negotiation_failed", true).await;
                return;
            }
        };
        if let Err(err) = session.link.set_local_description(offer.clone()).await {
            self.log.error(format!("applying local offer failed: {err}"));
            self.end_session("negotiation_failed", true).await;
            return;
        }
        session.offer_sent = true;
        self.send_or_end(SignalEnvelope::sdp(offer)).await;
    }

    async fn on_offer(&mut self, offer: SdpPayload) {
        let Some(session) = self.session.as_mut() else {
            self.log.ignored("offer received outside an active session");
            return;
        };
        if session.offer_sent || session.role == CallRole::Initiator {
            self.log.error(
                "offer received while our own offer is pending; both sides claim initiator",
            );
            self.end_session("initiator_conflict", true).await;
            return;
        }

        if let Err(err) = session.link.set_remote_description(offer).await {
            self.log.error(format!("applying remote offer failed: {err}"));
            self.end_session("negotiation_failed", true).await;
            return;
        }
        session.remote_described = true;
        self.flush_pending_candidates().await;

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let answer = match session.link.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.log.error(format!("answer creation failed: {err}"));
                self.end_session("negotiation_failed", true).await;
                return;
            }
        };
        if let Err(err) = session.link.set_local_description(answer.clone()).await {
            self.log.error(format!("applying local answer failed: {err}"));
            self.end_session("negotiation_failed", true).await;
            return;
        }
        if !self.send_or_end(SignalEnvelope::sdp(answer)).await {
            return;
        }
        self.deadline = None;
        self.set_state(SessionState::Connected);
        self.log.status("answer sent; session connected");
    }

    async fn on_answer(&mut self, answer: SdpPayload) {
        let Some(session) = self.session.as_mut() else {
            self.log.ignored("answer received outside an active session");
            return;
        };
        let sub_state = session.link.signaling_state();
        if sub_state != SignalingSubState::HaveLocalOffer {
            self.log.ignored(format!(
                "answer ignored in signaling sub-state {sub_state:?}"
            ));
            return;
        }

        if let Err(err) = session.link.set_remote_description(answer).await {
            self.log.error(format!("applying remote answer failed: {err}"));
            self.end_session("negotiation_failed", true).await;
            return;
        }
        session.remote_described = true;
        self.flush_pending_candidates().await;
        self.deadline = None;
        self.set_state(SessionState::Connected);
        self.log.status("answer applied; session connected");
    }

    async fn on_remote_candidate(&mut self, candidate: IcePayload) {
        let Some(session) = self.session.as_mut() else {
            self.log
                .ignored("candidate received outside an active session");
            return;
        };
        if !session.remote_described {
            session.pending_candidates.push(candidate);
            let pending = session.pending_candidates.len();
            self.log.status(format!(
                "buffered remote candidate until a description arrives ({pending} pending)"
            ));
            return;
        }
        if let Err(err) = session.link.add_remote_candidate(candidate).await {
            self.log
                .error(format!("failed to add remote candidate: {err}"));
        }
    }

    async fn flush_pending_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut session.pending_candidates);
        let count = pending.len();
        for candidate in pending {
            if let Err(err) = session.link.add_remote_candidate(candidate).await {
                self.log
                    .error(format!("failed to add buffered candidate: {err}"));
            }
        }
        self.log
            .status(format!("flushed {count} buffered candidates"));
    }

    async fn on_media(&mut self, generation: u64, event: MediaEvent) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if generation != session.generation {
            tracing::trace!(
                target = "session",
                generation,
                current = session.generation,
                "discarding media event from a torn-down link"
            );
            return;
        }
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                self.send_or_end(SignalEnvelope::ice(candidate)).await;
            }
            MediaEvent::RemoteTrack { id, kind } => {
                self.log
                    .status(format!("remote {kind} track {id} attached to output"));
            }
            MediaEvent::ConnectionState(state) => {
                self.log.status(format!("peer link state: {state:?}"));
            }
        }
    }

    async fn on_deadline(&mut self) {
        match self.state {
            SessionState::AwaitingMatch => {
                self.log.error("timed out waiting to be matched");
                self.end_session("negotiation_timeout", false).await;
            }
            SessionState::Negotiating => {
                self.log.error("timed out negotiating with the partner");
                self.end_session("negotiation_timeout", true).await;
            }
            _ => {
                self.deadline = None;
            }
        }
    }

    /// Sends an envelope, ending the session if the channel is gone.
    /// Returns whether the send succeeded.
    async fn send_or_end(&mut self, envelope: SignalEnvelope) -> bool {
        if self.channel.send(envelope).is_err() {
            self.log.error("signaling channel refused the send");
            self.end_session("channel_closed", false).await;
            return false;
        }
        true
    }

    /// Idempotent teardown: notifies the partner when asked, releases the
    /// peer link and any pre-built spare exactly once, closes the channel.
    async fn end_session(&mut self, reason: &str, notify_partner: bool) {
        if self.state == SessionState::Ended {
            return;
        }
        if notify_partner && self.session.is_some() {
            let _ = self.channel.send(SignalEnvelope::call_end(reason));
        }
        if let Some(session) = self.session.take() {
            self.log
                .status(format!("releasing peer link for {}", session.partner));
            session.link.close().await;
        }
        if let Some(link) = self.spare_link.take() {
            link.close().await;
        }
        self.channel.close();
        self.deadline = None;
        self.set_state(SessionState::Ended);
        self.log.status(format!("session ended: {reason}"));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(target = "session", from = ?self.state, to = ?state, "state change");
        self.state = state;
        let _ = self.state_tx.send(state);
    }
}
