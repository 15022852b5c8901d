use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use monitor_core::{ChannelEvent, ConnectionState, DisasterChannel, PushMessage, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Serves a single WebSocket connection with the given behavior and
/// returns the url to dial.
async fn ws_server<F, Fut>(handler: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                handler(ws).await;
            }
        }
    });
    format!("ws://{addr}")
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<ChannelEvent>,
) -> ChannelEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("channel event stream closed")
}

#[tokio::test]
async fn delivers_typed_push_messages() {
    let url = ws_server(|mut ws| async move {
        let event = serde_json::json!({
            "type": "new_disaster",
            "data": {
                "title": "Flood in Hue",
                "source": "vnexpress",
                "url": "http://example.com/1",
                "disaster_type": "flood",
                "severity": "high",
                "confidence": 0.93,
                "matched_keywords": ["lũ lụt"]
            },
            "timestamp": "2024-10-21T08:00:00Z"
        });
        ws.send(Message::text(event.to_string())).await.ok();
        tokio::time::sleep(Duration::from_millis(300)).await;
    })
    .await;

    let channel = DisasterChannel::new(url);
    let mut events = channel.subscribe();
    channel.connect().await.expect("connect failed");
    assert!(channel.state().is_open());

    assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected));
    match next_event(&mut events).await {
        ChannelEvent::Message(PushMessage::NewDisaster { data, .. }) => {
            assert_eq!(data.title, "Flood in Hue");
            assert_eq!(data.severity.as_deref(), Some("high"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    channel.disconnect().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let url = ws_server(|mut ws| async move {
        ws.send(Message::text(r#"{"garbage": true}"#.to_string()))
            .await
            .ok();
        ws.send(Message::text(r#"not even json"#.to_string())).await.ok();
        ws.send(Message::text(r#"{"type": "heartbeat"}"#.to_string()))
            .await
            .ok();
        tokio::time::sleep(Duration::from_millis(300)).await;
    })
    .await;

    let channel = DisasterChannel::new(url);
    let mut events = channel.subscribe();
    channel.connect().await.expect("connect failed");

    assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected));
    // Both malformed frames vanish; the next delivered event is the
    // heartbeat and the connection stays open throughout.
    match next_event(&mut events).await {
        ChannelEvent::Message(PushMessage::Heartbeat { .. }) => {}
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(channel.state().is_open());
    channel.disconnect().await;
}

#[tokio::test]
async fn connect_is_idempotent_while_open() {
    let url = ws_server(|mut ws| async move {
        // Hold the connection until the client walks away.
        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    })
    .await;

    let channel = DisasterChannel::new(url);
    let mut events = channel.subscribe();
    channel.connect().await.expect("first connect failed");
    channel.connect().await.expect("repeat connect failed");
    assert!(channel.state().is_open());

    // Exactly one connected notification was broadcast.
    assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected));
    assert!(
        timeout(Duration::from_millis(200), events.recv()).await.is_err(),
        "a second socket was opened"
    );
    channel.disconnect().await;
}

#[tokio::test]
async fn policy_close_marks_the_channel_terminal() {
    let url = ws_server(|mut ws| async move {
        ws.close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "forbidden".into(),
        }))
        .await
        .ok();
        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    })
    .await;

    let channel = DisasterChannel::new(url);
    let mut events = channel.subscribe();
    channel.connect().await.expect("connect failed");

    assert!(matches!(next_event(&mut events).await, ChannelEvent::Connected));
    match next_event(&mut events).await {
        ChannelEvent::Closed { terminal } => assert!(terminal),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(channel.is_terminal());

    // Terminal channels refuse to reconnect.
    let err = channel.connect().await.expect_err("reconnect must fail");
    assert!(matches!(err, TransportError::Terminal));
}

#[tokio::test]
async fn send_without_an_open_connection_is_a_noop() {
    let channel = DisasterChannel::new("ws://127.0.0.1:9/realtime/ws/disasters");
    channel.send(serde_json::json!({"type": "ping"})).await;
    assert_eq!(channel.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn refused_connection_fails_the_attempt() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
    let port = listener.local_addr().expect("no local addr").port();
    drop(listener);

    let channel = DisasterChannel::new(format!("ws://127.0.0.1:{port}"));
    let err = channel.connect().await.expect_err("connect must fail");
    assert!(matches!(err, TransportError::Handshake(_)));
    assert_eq!(channel.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn stalled_handshake_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        // Accept the socket but never answer the upgrade request.
        let _conn = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
    });

    let channel = DisasterChannel::new(format!("ws://{addr}"));
    let err = channel.connect().await.expect_err("connect must time out");
    assert!(matches!(err, TransportError::Timeout));
    assert_eq!(channel.state(), ConnectionState::Failed);
}
