use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use tincan::media::mock::MockLinkFactory;
use tincan::protocol::SdpKind;
use tincan::session::log::{LogKind, SessionLog};
use tincan::session::{CallHandle, NegotiationController, SessionState, SessionTimeouts};
use tincan::transport::RelayChannel;

type PeerTx = mpsc::UnboundedSender<String>;

struct RelayState {
    waiting: AsyncMutex<Option<WaitingPeer>>,
}

struct WaitingPeer {
    tx: PeerTx,
    partner: Arc<AsyncMutex<Option<PeerTx>>>,
}

/// Minimal matchmaking relay: pairs connections two at a time, designates
/// the first joiner as initiator, and forwards every subsequent frame to
/// the partner verbatim.
async fn spawn_relay() -> SocketAddr {
    let state = Arc::new(RelayState {
        waiting: AsyncMutex::new(None),
    });
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_peer(socket, state))
}

async fn handle_peer(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let my_partner = Arc::new(AsyncMutex::new(None::<PeerTx>));
    {
        let mut waiting = state.waiting.lock().await;
        match waiting.take() {
            Some(first) => {
                *first.partner.lock().await = Some(tx.clone());
                *my_partner.lock().await = Some(first.tx.clone());
                let _ = first.tx.send(
                    r#"{"type":"matched","payload":{"partner":"peer-b","initiator":true}}"#
                        .to_string(),
                );
                let _ = tx.send(
                    r#"{"type":"matched","payload":{"partner":"peer-a","initiator":false}}"#
                        .to_string(),
                );
            }
            None => {
                let _ = tx.send(r#"{"type":"waiting"}"#.to_string());
                waiting.replace(WaitingPeer {
                    tx: tx.clone(),
                    partner: my_partner.clone(),
                });
            }
        }
    }

    while let Some(Ok(frame)) = stream.next().await {
        if let WsMessage::Text(text) = frame {
            if let Some(partner) = my_partner.lock().await.clone() {
                let _ = partner.send(text);
            }
        }
    }
}

struct Peer {
    handle: CallHandle,
    factory: Arc<MockLinkFactory>,
    log: SessionLog,
}

async fn join_relay(addr: SocketAddr, tag: &str) -> Peer {
    let log = SessionLog::new();
    let (channel, channel_events) = RelayChannel::connect(&format!("ws://{addr}/ws"), log.clone())
        .await
        .expect("connect relay channel");
    let factory = Arc::new(MockLinkFactory::new(tag));
    let handle = NegotiationController::launch(
        channel,
        channel_events,
        factory.clone(),
        log.clone(),
        SessionTimeouts::default(),
    )
    .await
    .expect("launch controller");
    Peer {
        handle,
        factory,
        log,
    }
}

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn wait_for_state(peer: &Peer, state: SessionState) {
    let mut states = peer.handle.state_changes();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if *states.borrow() == state {
            return;
        }
        if Instant::now() >= deadline {
            panic!("state {state:?} not reached, still {:?}", *states.borrow());
        }
        let _ = timeout(Duration::from_millis(200), states.changed()).await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("condition not met within deadline");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn sent_sdp_count(log: &SessionLog, kind: SdpKind) -> usize {
    log.count_matching(LogKind::Sent, &format!("signal sdp {kind}"))
}

#[tokio::test]
async fn two_peers_negotiate_to_connected() {
    init_tracing();
    let addr = spawn_relay().await;

    let caller = join_relay(addr, "caller").await;
    wait_until(|| caller.log.count_matching(LogKind::Received, "waiting") == 1).await;

    let callee = join_relay(addr, "callee").await;

    wait_for_state(&caller, SessionState::Connected).await;
    wait_for_state(&callee, SessionState::Connected).await;

    // Only the designated initiator offered; the other side answered.
    assert_eq!(sent_sdp_count(&caller.log, SdpKind::Offer), 1);
    assert_eq!(sent_sdp_count(&caller.log, SdpKind::Answer), 0);
    assert_eq!(sent_sdp_count(&callee.log, SdpKind::Offer), 0);
    assert_eq!(sent_sdp_count(&callee.log, SdpKind::Answer), 1);

    // Trickled candidates crossed in both directions.
    wait_until(|| caller.factory.link(0).candidates_added() == 2).await;
    wait_until(|| callee.factory.link(0).candidates_added() == 2).await;
}

#[tokio::test]
async fn hang_up_propagates_to_partner() {
    init_tracing();
    let addr = spawn_relay().await;

    let caller = join_relay(addr, "caller").await;
    wait_until(|| caller.log.count_matching(LogKind::Received, "waiting") == 1).await;
    let callee = join_relay(addr, "callee").await;
    wait_for_state(&caller, SessionState::Connected).await;
    wait_for_state(&callee, SessionState::Connected).await;

    caller.handle.hang_up("done talking");

    assert_eq!(caller.handle.join().await, SessionState::Ended);
    wait_for_state(&callee, SessionState::Ended).await;
    assert_eq!(
        callee
            .log
            .count_matching(LogKind::Status, "partner ended the call: done talking"),
        1
    );
    assert_eq!(caller.factory.link(0).close_count(), 1);
    assert_eq!(callee.factory.link(0).close_count(), 1);
}

#[tokio::test]
async fn exactly_one_description_crosses_each_way() {
    init_tracing();
    let addr = spawn_relay().await;

    let caller = join_relay(addr, "caller").await;
    wait_until(|| caller.log.count_matching(LogKind::Received, "waiting") == 1).await;
    let callee = join_relay(addr, "callee").await;
    wait_for_state(&caller, SessionState::Connected).await;
    wait_for_state(&callee, SessionState::Connected).await;

    assert_eq!(
        caller
            .log
            .count_matching(LogKind::Received, "signal sdp answer"),
        1
    );
    assert_eq!(
        caller
            .log
            .count_matching(LogKind::Received, "signal sdp offer"),
        0
    );
    assert_eq!(
        callee
            .log
            .count_matching(LogKind::Received, "signal sdp offer"),
        1
    );
    assert_eq!(
        callee
            .log
            .count_matching(LogKind::Received, "signal sdp answer"),
        0
    );
}
