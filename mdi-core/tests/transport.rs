//! End-to-end tests against a real WebSocket server on localhost.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};

use mdi_core::{
    CacheConfig, ConnectionState, HeartbeatPayload, LoaderConfig, MdiCodec, MemoryStore, PixelBuffer,
    SliceCache, SliceDataPayload, SliceLoader, SystemClock, TransportConfig, TransportEvent,
    TransportManager, WorkerConfig, WorkerOffload,
};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

fn config(url: &str) -> TransportConfig {
    TransportConfig {
        url: url.to_owned(),
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        ping_interval_ms: 0,
        heartbeat_timeout_ms: 0,
        ..TransportConfig::default()
    }
}

async fn next_event(
    events: &mut UnboundedReceiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("driver stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_text(ws: &mut ServerSocket) -> Value {
    timeout(WAIT, async {
        loop {
            match ws.next().await.expect("client went away").unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for text frame")
}

fn slice(file_id: &str, index: u32) -> SliceDataPayload {
    let pixels: Vec<u16> = (0..64).map(|v| v * 64).collect();
    SliceDataPayload {
        file_id: file_id.into(),
        slice_index: index,
        width: 8,
        height: 8,
        min_value: 0.0,
        max_value: 4095.0,
        window_center: 400.0,
        window_width: 2000.0,
        data: PixelBuffer::from_values(&pixels),
    }
}

#[tokio::test]
async fn queued_requests_flush_in_order_on_connect() {
    let (listener, url) = bind().await;
    let (transport, mut events) = TransportManager::spawn(config(&url)).unwrap();

    transport.request_slice("ct-chest", 1).await.unwrap();
    transport.request_metadata("ct-chest").await.unwrap();
    assert_eq!(transport.stats().await.unwrap().queued, 2);

    transport.connect().await.unwrap();
    let mut ws = accept(&listener).await;
    next_event(&mut events, |e| matches!(e, TransportEvent::Open)).await;

    let first = next_text(&mut ws).await;
    assert_eq!(first, json!({ "type": "request_slice", "file_id": "ct-chest", "slice_index": 1 }));
    let second = next_text(&mut ws).await;
    assert_eq!(second, json!({ "type": "request_metadata", "file_id": "ct-chest" }));

    assert!(transport.is_connected());
    assert_eq!(transport.stats().await.unwrap().queued, 0);
}

#[tokio::test]
async fn binary_frames_become_events() {
    let (listener, url) = bind().await;
    let (transport, mut events) = TransportManager::spawn(config(&url)).unwrap();
    transport.connect().await.unwrap();
    let mut ws = accept(&listener).await;

    let codec = MdiCodec::new();
    let heartbeat = HeartbeatPayload {
        timestamp_ms: 1_700_000_000_123,
        server_load: 0.5,
    };
    let mut corrupt = codec.encode_slice(&slice("ct-chest", 2), 6).unwrap().to_vec();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x01;

    ws.send(Message::Binary(codec.encode_slice(&slice("ct-chest", 1), 5).unwrap()))
        .await
        .unwrap();
    ws.send(Message::Binary(corrupt.into())).await.unwrap();
    ws.send(Message::Binary(codec.encode_heartbeat(&heartbeat, 7).unwrap()))
        .await
        .unwrap();

    match next_event(&mut events, |e| matches!(e, TransportEvent::SliceData { .. })).await {
        TransportEvent::SliceData { sequence, slice: got } => {
            assert_eq!(sequence, 5);
            assert_eq!(got, slice("ct-chest", 1));
        }
        _ => unreachable!(),
    }
    next_event(&mut events, |e| matches!(e, TransportEvent::ProtocolError(_))).await;
    next_event(&mut events, |e| matches!(e, TransportEvent::Heartbeat { sequence: 7, .. })).await;

    assert_eq!(transport.last_heartbeat(), Some(heartbeat));
    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.frames_received, 3);
    assert_eq!(stats.frames_rejected, 1);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let (listener, url) = bind().await;
    let (transport, mut events) = TransportManager::spawn(config(&url)).unwrap();
    transport.connect().await.unwrap();
    let mut ws = accept(&listener).await;
    next_event(&mut events, |e| matches!(e, TransportEvent::Open)).await;

    ws.close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "restart".into(),
    }))
    .await
    .unwrap();

    match next_event(&mut events, |e| matches!(e, TransportEvent::Close { .. })).await {
        TransportEvent::Close { code, reason, manual } => {
            assert_eq!(code, Some(1001));
            assert_eq!(reason, "restart");
            assert!(!manual);
        }
        _ => unreachable!(),
    }
    next_event(&mut events, |e| matches!(e, TransportEvent::Reconnecting { attempt: 1, .. })).await;

    let _ws = accept(&listener).await;
    next_event(&mut events, |e| matches!(e, TransportEvent::Open)).await;
    timeout(WAIT, transport.wait_for_state(ConnectionState::is_connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.stats().await.unwrap().reconnect_attempts, 0);
}

#[tokio::test]
async fn silent_server_trips_liveness_timeout() {
    let (listener, url) = bind().await;
    let config = TransportConfig {
        heartbeat_timeout_ms: 150,
        ..config(&url)
    };
    let (transport, mut events) = TransportManager::spawn(config).unwrap();
    transport.connect().await.unwrap();
    let _silent = accept(&listener).await;

    match next_event(&mut events, |e| matches!(e, TransportEvent::Close { .. })).await {
        TransportEvent::Close { reason, manual, .. } => {
            assert_eq!(reason, "heartbeat timeout");
            assert!(!manual);
        }
        _ => unreachable!(),
    }
    let _second = accept(&listener).await;
    next_event(&mut events, |e| matches!(e, TransportEvent::Open)).await;
}

#[tokio::test]
async fn pings_are_sent_and_pongs_reported() {
    let (listener, url) = bind().await;
    let config = TransportConfig {
        ping_interval_ms: 50,
        heartbeat_timeout_ms: 2_000,
        ..config(&url)
    };
    let (transport, mut events) = TransportManager::spawn(config).unwrap();
    transport.connect().await.unwrap();
    let mut ws = accept(&listener).await;

    assert_eq!(next_text(&mut ws).await, json!({ "type": "ping" }));
    ws.send(Message::text(r#"{"type":"pong","timestamp":123}"#))
        .await
        .unwrap();

    match next_event(&mut events, |e| matches!(e, TransportEvent::Pong { .. })).await {
        TransportEvent::Pong { timestamp } => assert_eq!(timestamp, Some(123)),
        _ => unreachable!(),
    }
    assert!(transport.is_connected());
}

#[tokio::test]
async fn manual_disconnect_does_not_reconnect() {
    let (listener, url) = bind().await;
    let (transport, mut events) = TransportManager::spawn(config(&url)).unwrap();
    transport.connect().await.unwrap();
    let mut ws = accept(&listener).await;
    next_event(&mut events, |e| matches!(e, TransportEvent::Open)).await;

    transport.disconnect().await.unwrap();
    match next_event(&mut events, |e| matches!(e, TransportEvent::Close { .. })).await {
        TransportEvent::Close { manual, .. } => assert!(manual),
        _ => unreachable!(),
    }
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    assert!(
        timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err(),
        "client reconnected after a manual disconnect"
    );
}

#[tokio::test]
async fn loader_fetches_over_socket_and_serves_from_cache() {
    let (listener, url) = bind().await;
    let offload = WorkerOffload::new(WorkerConfig::default());
    let (transport, events) = TransportManager::spawn_with_offload(config(&url), Some(offload)).unwrap();
    let cache = Arc::new(
        SliceCache::with_store(
            CacheConfig {
                prefetch_count: 0,
                ..CacheConfig::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        )
        .await
        .unwrap(),
    );
    let (loader, _forwarded) = SliceLoader::new(cache, transport.clone(), events, LoaderConfig::default());

    transport.connect().await.unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let codec = MdiCodec::new();
        let mut requests = 0u32;
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let request: Value = serde_json::from_str(text.as_str()).unwrap();
            if request["type"] != "request_slice" {
                continue;
            }
            requests += 1;
            let file_id = request["file_id"].as_str().unwrap();
            let index = request["slice_index"].as_u64().unwrap() as u32;
            let frame = codec.encode_slice(&slice(file_id, index), requests).unwrap();
            ws.send(Message::Binary(frame)).await.unwrap();
        }
        requests
    });

    let first = loader.get_slice("ct-chest", 25).await.unwrap();
    assert_eq!(first, slice("ct-chest", 25));
    assert_eq!(first.data.typed::<u16>().unwrap().len(), 64);

    let again = loader.get_slice("ct-chest", 25).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(loader.cache().stats().await.l1.hits, 1);

    loader.shutdown().await;
    transport.shutdown().await.unwrap();
    let requests = timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(requests, 1);
}
