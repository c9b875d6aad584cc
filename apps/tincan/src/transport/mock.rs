use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{SignalingChannel, TransportError};
use crate::protocol::SignalEnvelope;

/// In-memory signaling channel for tests: records every envelope handed to
/// `send` and can be switched into a failing state to simulate a dead
/// connection.
#[derive(Default)]
pub struct MockChannel {
    sent: Mutex<Vec<SignalEnvelope>>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SignalingChannel for MockChannel {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
