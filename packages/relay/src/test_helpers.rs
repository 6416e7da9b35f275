use futures::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::AppState;
use crate::config::{FileConfig, RelayConfig, ServerFileConfig};

pub type TestClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `AppState` with default tunables, bound to loopback on an ephemeral port.
pub fn test_app_state() -> AppState {
    AppState::new(loopback_config())
}

fn loopback_config() -> RelayConfig {
    let fc = FileConfig {
        server: ServerFileConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        },
    };
    RelayConfig::from_file(&fc).expect("loopback config")
}

/// Serve the full router on `127.0.0.1:0` in the background.
pub async fn spawn_test_server() -> (SocketAddr, AppState) {
    spawn_server_with(loopback_config()).await
}

pub async fn spawn_server_with(config: RelayConfig) -> (SocketAddr, AppState) {
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = AppState::new(config);
    let app = crate::build_router(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (addr, state)
}

pub async fn connect(addr: SocketAddr) -> TestClient {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("connect");
    client
}

/// The upgrade handshake finishes before the server registers the
/// connection, so poll until the registry catches up.
pub async fn wait_for_connections(state: &AppState, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.registry.len() != expected {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "registry has {} connections, expected {}",
                state.registry.len(),
                expected
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next frame must be text; returns its contents.
pub async fn expect_text(client: &mut TestClient) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("read error");
    match frame {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("Expected text frame, got {:?}", other),
    }
}

/// No frame arrives within a short window.
pub async fn expect_silence(client: &mut TestClient) {
    if let Ok(frame) = tokio::time::timeout(Duration::from_millis(200), client.next()).await {
        panic!("Expected no frame, got {:?}", frame);
    }
}
