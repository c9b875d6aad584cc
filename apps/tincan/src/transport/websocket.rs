use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{ChannelEvent, SignalingChannel, TransportError};
use crate::protocol::SignalEnvelope;
use crate::session::log::SessionLog;

enum Outbound {
    Envelope(SignalEnvelope),
    Shutdown,
}

/// One persistent WebSocket connection to the matchmaking relay. A writer
/// task drains the outbound queue; a reader task parses inbound frames and
/// feeds the `ChannelEvent` stream, ending it with a terminal `Closed`.
pub struct RelayChannel {
    send_tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    log: SessionLog,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RelayChannel {
    pub async fn connect(
        relay_url: &str,
        log: SessionLog,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>), TransportError> {
        let url = derive_websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        let writer_handle = tokio::spawn(async move {
            while let Some(outbound) = send_rx.recv().await {
                match outbound {
                    Outbound::Envelope(envelope) => {
                        let Ok(text) = serde_json::to_string(&envelope) else {
                            continue;
                        };
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Shutdown => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_log = log.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reason = "connection closed".to_string();
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        deliver_frame(&reader_log, &events_tx, &text);
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            deliver_frame(&reader_log, &events_tx, &text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "relay websocket error");
                        reason = err.to_string();
                        break;
                    }
                }
            }
            let _ = events_tx.send(ChannelEvent::Closed { reason });
        });

        let channel = Arc::new(RelayChannel {
            send_tx,
            closed: AtomicBool::new(false),
            log,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        });
        Ok((channel, events_rx))
    }
}

fn deliver_frame(
    log: &SessionLog,
    events_tx: &mpsc::UnboundedSender<ChannelEvent>,
    text: &str,
) {
    match serde_json::from_str::<SignalEnvelope>(text) {
        Ok(envelope) => {
            log.received(&envelope);
            let _ = events_tx.send(ChannelEvent::Envelope(envelope));
        }
        Err(err) => {
            log.error(format!("unparseable relay frame dropped: {err}"));
        }
    }
}

impl SignalingChannel for RelayChannel {
    fn send(&self, envelope: SignalEnvelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.log.sent(&envelope);
        self.send_tx
            .send(Outbound::Envelope(envelope))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.send_tx.send(Outbound::Shutdown);
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn derive_websocket_url(relay_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let mapped = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(mapped)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_urls_pass_through() {
        let url = derive_websocket_url("ws://127.0.0.1:8000/ws").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8000/ws");
    }

    #[test]
    fn https_maps_to_wss() {
        let url = derive_websocket_url("https://relay.example.com/ws").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            derive_websocket_url("ftp://relay.example.com/ws"),
            Err(TransportError::Setup(_))
        ));
    }
}
