use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::protocol::SignalEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Sent,
    Received,
    Status,
    Ignored,
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogKind::Sent => "sent",
            LogKind::Received => "recv",
            LogKind::Status => "status",
            LogKind::Ignored => "ignored",
            LogKind::Error => "error",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: SystemTime,
    pub kind: LogKind,
    pub message: String,
}

/// Append-only observer of session traffic and status. Purely for
/// presentation: nothing reads it back into control flow. Entries are
/// retained for inspection, broadcast to live subscribers, and mirrored to
/// `tracing`.
#[derive(Clone)]
pub struct SessionLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    entries: Mutex<Vec<LogEntry>>,
    broadcast: broadcast::Sender<LogEntry>,
}

impl SessionLog {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(LogInner {
                entries: Mutex::new(Vec::new()),
                broadcast,
            }),
        }
    }

    pub fn sent(&self, envelope: &SignalEnvelope) {
        self.push(LogKind::Sent, envelope.summary());
    }

    pub fn received(&self, envelope: &SignalEnvelope) {
        self.push(LogKind::Received, envelope.summary());
    }

    pub fn status(&self, message: impl Into<String>) {
        self.push(LogKind::Status, message.into());
    }

    pub fn ignored(&self, message: impl Into<String>) {
        self.push(LogKind::Ignored, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogKind::Error, message.into());
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.entries.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.broadcast.subscribe()
    }

    /// Number of retained entries of `kind` whose message contains `needle`.
    pub fn count_matching(&self, kind: LogKind, needle: &str) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|entry| entry.kind == kind && entry.message.contains(needle))
            .count()
    }

    fn push(&self, kind: LogKind, message: String) {
        match kind {
            LogKind::Sent | LogKind::Received | LogKind::Ignored => {
                tracing::debug!(target = "session", kind = %kind, "{message}");
            }
            LogKind::Status => {
                tracing::info!(target = "session", "{message}");
            }
            LogKind::Error => {
                tracing::warn!(target = "session", "{message}");
            }
        }
        let entry = LogEntry {
            at: SystemTime::now(),
            kind,
            message,
        };
        self.inner.entries.lock().push(entry.clone());
        let _ = self.inner.broadcast.send(entry);
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SdpPayload;

    #[test]
    fn entries_accumulate_in_order() {
        let log = SessionLog::new();
        log.status("awaiting match");
        log.sent(&SignalEnvelope::sdp(SdpPayload::offer("v=0")));
        log.ignored("stray answer");

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, LogKind::Status);
        assert_eq!(entries[1].kind, LogKind::Sent);
        assert_eq!(entries[2].kind, LogKind::Ignored);
        assert_eq!(log.count_matching(LogKind::Ignored, "stray"), 1);
    }

    #[tokio::test]
    async fn subscribers_observe_new_entries() {
        let log = SessionLog::new();
        let mut rx = log.subscribe();
        log.status("matched");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.kind, LogKind::Status);
        assert_eq!(entry.message, "matched");
    }
}
