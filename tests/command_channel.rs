use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

use vaonis_link::channel::{CONNECT_EVENT, CONTROL_ERROR, DISCONNECT_EVENT, STATUS_UPDATED};
use vaonis_link::{ChannelConfig, CommandChannel, VaonisError};

type ServerWs = WebSocketStream<TcpStream>;

struct Accepted {
    ws: ServerWs,
    uri: String,
}

/// Accepts one client, runs the Engine.IO open and namespace handshake and
/// hands the socket to the test. `connect_reply` answers the client's `40`.
async fn spawn_server(
    ping_interval: u64,
    ping_timeout: u64,
    connect_reply: &'static str,
) -> (String, oneshot::Receiver<Accepted>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut uri = String::new();
        let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
            uri = req.uri().to_string();
            Ok(resp)
        })
        .await
        .unwrap();

        let open = json!({
            "sid": "engine-sid",
            "upgrades": [],
            "pingInterval": ping_interval,
            "pingTimeout": ping_timeout,
            "maxPayload": 1_000_000
        });
        send_text(&mut ws, &format!("0{}", open)).await;
        assert_eq!(recv_text(&mut ws).await, "40");
        send_text(&mut ws, connect_reply).await;

        let _ = tx.send(Accepted { ws, uri });
    });

    (url, rx)
}

async fn send_text(ws: &mut ServerWs, frame: &str) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn recv_text(ws: &mut ServerWs) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

fn config(url: &str) -> ChannelConfig {
    ChannelConfig {
        url: url.to_string(),
        name: Some("rig".into()),
        debug: true,
        ack_timeout: Duration::from_secs(2),
        ..ChannelConfig::new("test-device")
    }
}

const CONNECTED: &str = r#"40{"sid":"socket-sid"}"#;

#[tokio::test]
async fn test_query_identifies_client_and_commands_are_framed() {
    let (url, accepted) = spawn_server(25_000, 20_000, CONNECTED).await;
    let channel = CommandChannel::builder(config(&url)).connect().await.unwrap();
    let Accepted { mut ws, uri } = accepted.await.unwrap();

    assert_eq!(
        uri,
        "/socket.io/?EIO=4&transport=websocket&id=test-device&name=rig&debug=true"
    );

    channel.take_control(None).unwrap();
    assert_eq!(recv_text(&mut ws).await, r#"42["message",["takeControl"]]"#);

    channel.release_control(Some("user-1")).unwrap();
    assert_eq!(
        recv_text(&mut ws).await,
        r#"42["message",["releaseControl",{"userId":"user-1"}]]"#
    );

    channel.set_system_time(1_700_000_000_000, true).unwrap();
    assert_eq!(
        recv_text(&mut ws).await,
        r#"42["message",["setSystemTime",{"timestamp":1700000000000}]]"#
    );

    channel.set_user_name(None).unwrap();
    assert_eq!(
        recv_text(&mut ws).await,
        r#"42["message",["setUserName",{"device":"test-device","user":"null"}]]"#
    );

    // Names outside the known command set go out unchanged.
    channel.send_command("customThing", Some(json!(5))).unwrap();
    assert_eq!(recv_text(&mut ws).await, r#"42["message",["customThing",5]]"#);

    channel.disconnect().await.unwrap();
    assert_eq!(recv_text(&mut ws).await, "41");
}

#[tokio::test]
async fn test_acks_pair_with_their_commands() {
    let (url, accepted) = spawn_server(25_000, 20_000, CONNECTED).await;
    let channel = CommandChannel::builder(config(&url)).connect().await.unwrap();
    let Accepted { mut ws, .. } = accepted.await.unwrap();

    let server = async {
        assert_eq!(recv_text(&mut ws).await, r#"420["message",["getStatus"]]"#);
        send_text(&mut ws, r#"430[{"error":"not in control"}]"#).await;
    };
    let (ack, ()) = tokio::join!(channel.get_status(), server);
    let ack = ack.unwrap();
    assert_eq!(ack.id, 0);
    assert_eq!(ack.error(), Some(&json!("not in control")));

    let server = async {
        assert_eq!(recv_text(&mut ws).await, r#"421["message",["restartApp"]]"#);
        send_text(&mut ws, r#"431[null,{"restarting":true}]"#).await;
    };
    let (ack, ()) = tokio::join!(channel.restart_app(), server);
    let ack = ack.unwrap();
    assert_eq!(ack.id, 1);
    assert!(!ack.is_error());
    assert_eq!(ack.args[1], json!({"restarting": true}));
}

#[tokio::test]
async fn test_push_events_arrive_in_order_and_pings_are_answered() {
    let (url, accepted) = spawn_server(25_000, 20_000, CONNECTED).await;
    let (events_tx, mut events) = mpsc::unbounded_channel::<(String, Value)>();

    let mut builder = CommandChannel::builder(config(&url));
    for name in [CONNECT_EVENT, STATUS_UPDATED, CONTROL_ERROR] {
        let tx = events_tx.clone();
        builder = builder.on(name, move |payload| {
            let _ = tx.send((name.to_string(), payload.clone()));
        });
    }
    let _channel = builder.connect().await.unwrap();
    let Accepted { mut ws, .. } = accepted.await.unwrap();

    send_text(&mut ws, r#"42["STATUS_UPDATED",{"n":1}]"#).await;
    send_text(&mut ws, "2").await;
    send_text(&mut ws, r#"427["STATUS_UPDATED",{"n":2}]"#).await;
    send_text(&mut ws, r#"42["CONTROL_ERROR","busy"]"#).await;
    send_text(&mut ws, r#"42["STATUS_UPDATED",1,2]"#).await;
    send_text(&mut ws, r#"42["UNHANDLED",{}]"#).await;
    send_text(&mut ws, r#"42["STATUS_UPDATED"]"#).await;

    assert_eq!(recv_text(&mut ws).await, "3");
    assert_eq!(recv_text(&mut ws).await, "437[]");

    let expected = [
        (CONNECT_EVENT, Value::Null),
        (STATUS_UPDATED, json!({"n": 1})),
        (STATUS_UPDATED, json!({"n": 2})),
        (CONTROL_ERROR, json!("busy")),
        (STATUS_UPDATED, json!([1, 2])),
        (STATUS_UPDATED, Value::Null),
    ];
    for (name, payload) in expected {
        let received = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, (name.to_string(), payload));
    }
}

#[tokio::test]
async fn test_ack_timeout_abandons_the_id() {
    let (url, accepted) = spawn_server(25_000, 20_000, CONNECTED).await;
    let channel = CommandChannel::builder(config(&url)).connect().await.unwrap();
    let Accepted { mut ws, .. } = accepted.await.unwrap();

    let err = channel
        .request_with_timeout("shutdown", None, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, VaonisError::AckTimeout { id: 0 }));

    // The late ack is discarded and the channel keeps working.
    assert_eq!(recv_text(&mut ws).await, r#"420["message",["shutdown"]]"#);
    send_text(&mut ws, "430[{}]").await;
    channel.take_control(Some("user-1")).unwrap();
    assert_eq!(
        recv_text(&mut ws).await,
        r#"42["message",["takeControl",{"userId":"user-1"}]]"#
    );
    assert!(!channel.is_closed());
}

#[tokio::test]
async fn test_server_close_fails_pending_commands() {
    let (url, accepted) = spawn_server(25_000, 20_000, CONNECTED).await;
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let channel = CommandChannel::builder(config(&url))
        .on_disconnect(move |_| {
            let _ = closed_tx.send(());
        })
        .connect()
        .await
        .unwrap();
    let Accepted { mut ws, .. } = accepted.await.unwrap();

    let server = async {
        assert_eq!(recv_text(&mut ws).await, r#"420["message",["getStatus"]]"#);
        ws.close(None).await.unwrap();
    };
    let (result, ()) = tokio::join!(channel.get_status(), server);
    assert!(matches!(result, Err(VaonisError::ChannelClosed)));

    tokio::time::timeout(Duration::from_secs(2), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    channel.closed().await;
    assert!(channel.is_closed());
    assert!(matches!(
        channel.send_command("takeControl", None),
        Err(VaonisError::ChannelClosed)
    ));
}

#[tokio::test]
async fn test_missing_heartbeat_closes_the_channel() {
    let (url, accepted) = spawn_server(100, 100, CONNECTED).await;
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let channel = CommandChannel::builder(config(&url))
        .on_disconnect(move |_| {
            let _ = closed_tx.send(());
        })
        .connect()
        .await
        .unwrap();
    let _server = accepted.await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(channel.is_closed());
}

#[tokio::test]
async fn test_connect_error_is_reported() {
    let (url, _accepted) = spawn_server(25_000, 20_000, r#"44{"message":"Not authorized"}"#).await;

    match CommandChannel::builder(config(&url)).connect().await {
        Err(VaonisError::Channel(message)) => assert!(message.contains("Not authorized")),
        Err(other) => panic!("expected channel error, got {other:?}"),
        Ok(_) => panic!("connect should have been refused"),
    }
}
