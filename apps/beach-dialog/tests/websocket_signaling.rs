use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use beach_dialog::MediaKind;
use beach_dialog::signaling::{
    ChannelState, ClientRequest, PROTOO_SUBPROTOCOL, ServerNotification, ServerRequest,
    SignalingChannel, SignalingEvent, WebSocketConnector,
};
use beach_dialog::signaling::protocol::JoinRequest;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use url::Url;

#[derive(Clone, Default)]
struct Observed {
    protocols: Arc<Mutex<Vec<String>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    responses: Arc<Mutex<Vec<Value>>>,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(observed): State<Observed>,
) -> impl IntoResponse {
    if let Some(protocol) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        observed.protocols.lock().unwrap().push(protocol.to_string());
    }
    observed.queries.lock().unwrap().push(query);
    ws.protocols([PROTOO_SUBPROTOCOL])
        .on_upgrade(move |socket| room(socket, observed))
}

async fn send(socket: &mut WebSocket, frame: Value) -> bool {
    socket.send(Message::Text(frame.to_string())).await.is_ok()
}

/// Answers requests like a room server. After `join` it announces a
/// producer and offers a consumer; `closeProducer` makes it hang up.
async fn room(mut socket: WebSocket, observed: Observed) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if frame["response"] == json!(true) {
            observed.responses.lock().unwrap().push(frame);
            continue;
        }
        let id = frame["id"].clone();
        let reply = match frame["method"].as_str().unwrap_or_default() {
            "getRouterRtpCapabilities" => json!({
                "response": true, "id": id, "ok": true,
                "data": { "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }], "headerExtensions": [] }
            }),
            "join" => json!({ "response": true, "id": id, "ok": true, "data": { "peers": [] } }),
            "pauseProducer" => json!({
                "response": true, "id": id, "ok": false,
                "errorCode": 404, "errorReason": "no such producer"
            }),
            _ => json!({ "response": true, "id": id, "ok": true, "data": {} }),
        };
        if !send(&mut socket, reply).await {
            return;
        }
        match frame["method"].as_str() {
            Some("join") => {
                send(
                    &mut socket,
                    json!({ "notification": true, "method": "newProducer", "data": { "producerId": "P1" } }),
                )
                .await;
                send(
                    &mut socket,
                    json!({
                        "request": true, "id": 900, "method": "newConsumer",
                        "data": {
                            "peerId": "alice", "producerId": "P1", "id": "C1",
                            "kind": "audio", "rtpParameters": {}
                        }
                    }),
                )
                .await;
            }
            Some("closeProducer") => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            _ => {}
        }
    }
}

async fn start_room() -> (SocketAddr, Observed) {
    let observed = Observed::default();
    let app = Router::new()
        .route("/", get(upgrade))
        .with_state(observed.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, observed)
}

fn room_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}/?roomId=R&peerId=me")).expect("url")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timed out")
        .expect("event stream ended")
}

fn join_request() -> ClientRequest {
    ClientRequest::Join(JoinRequest {
        display_name: "Me".into(),
        device: Default::default(),
        rtp_capabilities: json!({ "codecs": [] }),
        sctp_capabilities: None,
        token: None,
    })
}

#[test_timeout::tokio_timeout_test(15)]
async fn request_roundtrip_over_protoo_websocket() {
    let (addr, observed) = start_room().await;
    let channel = SignalingChannel::new(Arc::new(WebSocketConnector), Duration::from_secs(5), 0);
    let _events = channel.take_events().expect("events");
    channel.open(&room_url(addr)).await.expect("open");
    assert_eq!(channel.state(), ChannelState::Open);

    let caps = channel
        .request(ClientRequest::GetRouterRtpCapabilities)
        .await
        .expect("capabilities");
    assert_eq!(caps["codecs"][0]["mimeType"], json!("audio/opus"));

    assert_eq!(
        observed.protocols.lock().unwrap().as_slice(),
        [PROTOO_SUBPROTOCOL.to_string()]
    );
    let queries = observed.queries.lock().unwrap().clone();
    assert_eq!(queries[0].get("roomId").map(String::as_str), Some("R"));
    assert_eq!(queries[0].get("peerId").map(String::as_str), Some("me"));
    channel.close();
}

#[test_timeout::tokio_timeout_test(15)]
async fn rejected_request_carries_code_and_reason() {
    let (addr, _) = start_room().await;
    let channel = SignalingChannel::new(Arc::new(WebSocketConnector), Duration::from_secs(5), 0);
    let _events = channel.take_events().expect("events");
    channel.open(&room_url(addr)).await.expect("open");

    let err = channel
        .request(ClientRequest::PauseProducer {
            producer_id: "P9".into(),
        })
        .await
        .expect_err("rejected");
    let text = err.to_string();
    assert!(text.contains("404"), "{text}");
    assert!(text.contains("no such producer"), "{text}");
    assert!(channel.is_open());
}

#[test_timeout::tokio_timeout_test(15)]
async fn server_notifications_and_requests_reach_the_client() {
    let (addr, observed) = start_room().await;
    let channel = SignalingChannel::new(Arc::new(WebSocketConnector), Duration::from_secs(5), 0);
    let mut events = channel.take_events().expect("events");
    channel.open(&room_url(addr)).await.expect("open");
    channel.request(join_request()).await.expect("join");

    match next_event(&mut events).await {
        SignalingEvent::Notification(ServerNotification::NewProducer { producer_id }) => {
            assert_eq!(producer_id, "P1");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut events).await {
        SignalingEvent::Request(incoming) => {
            let (request, responder) = incoming.into_parts();
            match request {
                ServerRequest::NewConsumer(new_consumer) => {
                    assert_eq!(new_consumer.id, "C1");
                    assert_eq!(new_consumer.kind, MediaKind::Audio);
                }
                other => panic!("unexpected request {other:?}"),
            }
            responder.accept(json!({}));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(response) = observed.responses.lock().unwrap().first().cloned() {
            assert_eq!(response["id"], json!(900));
            assert_eq!(response["ok"], json!(true));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no response to newConsumer");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(15)]
async fn server_hangup_is_reported_as_remote_close() {
    let (addr, _) = start_room().await;
    let channel = SignalingChannel::new(Arc::new(WebSocketConnector), Duration::from_secs(5), 0);
    let mut events = channel.take_events().expect("events");
    channel.open(&room_url(addr)).await.expect("open");

    channel
        .request(ClientRequest::CloseProducer {
            producer_id: "P1".into(),
        })
        .await
        .expect("close acknowledged");

    loop {
        match next_event(&mut events).await {
            SignalingEvent::Closed { locally_initiated } => {
                assert!(!locally_initiated);
                break;
            }
            SignalingEvent::Error(_) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(channel.state(), ChannelState::Closed);
}
