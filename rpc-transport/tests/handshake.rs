//! Exercises `Transport` against an in-process fake appliance server: auth
//! handshake, a successful call, an error reply, and ping/pong.

use futures_util::{SinkExt, StreamExt};
use rpc_transport::Transport;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn fake_appliance() -> url::Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();

        // auth.login
        let msg = read.next().await.unwrap().unwrap();
        let req: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": true});
        write.send(Message::Text(reply.to_string())).await.unwrap();

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let req: Value = serde_json::from_str(&text).unwrap();
                    let id = req["id"].clone();
                    let method = req["method"].as_str().unwrap_or_default();
                    let reply = if method == "pool.list" {
                        json!({"jsonrpc": "2.0", "id": id, "result": ["tank"]})
                    } else {
                        json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32602, "message": "bad params"}})
                    };
                    write.send(Message::Text(reply.to_string())).await.unwrap();
                }
                Some(Ok(Message::Ping(p))) => {
                    write.send(Message::Pong(p)).await.unwrap();
                }
                _ => break,
            }
        }
    });

    url::Url::parse(&format!("ws://{}", addr)).unwrap()
}

#[tokio::test]
async fn call_roundtrips_through_handshake() {
    let url = fake_appliance().await;
    let transport = Transport::connect(url, "test-key");

    let pools: Vec<String> = transport.call("pool.list", None).await.unwrap();
    assert_eq!(pools, vec!["tank".to_string()]);
}

#[tokio::test]
async fn call_surfaces_rpc_error() {
    let url = fake_appliance().await;
    let transport = Transport::connect(url, "test-key");

    let result: rpc_transport::Result<Value> = transport.call("unknown.method", None).await;
    assert!(result.is_err());
}
