//! Client and server over a real axum WebSocket on a loopback port.

#![allow(clippy::panic)]

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use common::{client_config, registry};
use duplex_rpc::api;
use duplex_rpc::app_state::AppState;
use duplex_rpc::client::{ConnectionState, ServiceClient};
use duplex_rpc::config::{ClientConfig, ServerConfig};
use duplex_rpc::server::ServerDispatcher;

async fn spawn_server() -> (SocketAddr, ServerDispatcher) {
    let config = ServerConfig::default();
    let dispatcher = ServerDispatcher::new(registry(), &config);
    let app = api::build_router().with_state(AppState::new(dispatcher.clone(), config));

    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local address");
    };
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    (addr, dispatcher)
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..client_config()
    }
}

#[tokio::test]
async fn calls_and_events_over_websocket() {
    let (addr, dispatcher) = spawn_server().await;
    let Ok(client) = ServiceClient::connect(config_for(addr)).await else {
        panic!("websocket connect failed");
    };
    assert_eq!(client.state(), ConnectionState::Connected);

    let Ok(doubled) = client.send_request("double", vec![json!(8)], None).await else {
        panic!("call failed");
    };
    assert_eq!(doubled, json!(16));

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    tokio_test::assert_ok!(
        client
            .subscribe("news", json!({"lang": "en"}), move |data| {
                let _ = tx.send(data);
            })
            .await
    );
    let Ok(selected) = client.emit("news", |_| true, json!("hello")).await else {
        panic!("emit failed");
    };
    assert_eq!(selected, 1);
    let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await else {
        panic!("no event received");
    };
    assert_eq!(event, json!("hello"));
    assert_eq!(dispatcher.active_connections(), 1);

    client.close().await;
    for _ in 0..100 {
        if dispatcher.active_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatcher.active_connections(), 0);
}

#[tokio::test]
async fn split_response_over_websocket() {
    let (addr, _dispatcher) = spawn_server().await;
    let Ok(client) = ServiceClient::connect(config_for(addr)).await else {
        panic!("websocket connect failed");
    };
    let size = 5 * 1024 * 1024;
    let Ok(body) = client.send_request("blob", vec![json!(size)], None).await else {
        panic!("blob call failed");
    };
    let Some(bytes) = duplex_rpc::protocol::value::value_to_bytes(&body) else {
        panic!("body is not a buffer");
    };
    assert_eq!(bytes.len(), size);
}

#[tokio::test]
async fn refused_connect_without_reconnect_fails() {
    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local address");
    };
    drop(listener);
    assert!(ServiceClient::connect(config_for(addr)).await.is_err());
}
