#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use slotline::config::Config;

/// A slot present in [`two_device_mapping`].
pub const SLOT_5: &str = "000000000005";

/// The other slot present in [`two_device_mapping`].
pub const SLOT_6: &str = "000000000006";

/// A mapping with two devices on ports that do not exist; their links sit
/// in the retry backoff, which is all the wire-level tests need.
pub fn two_device_mapping() -> String {
    r#"{
        "devices": [
            {
                "id": "000000000005",
                "type": "DTA",
                "connectionProperties": { "port": "/dev/ttyO-test-05" }
            },
            {
                "id": "000000000006",
                "type": "DTA",
                "connectionProperties": { "port": "/dev/ttyO-test-06" }
            }
        ],
        "deviceType": "UART"
    }"#
    .to_string()
}

pub struct TestServer {
    pub port: u16,
    pub mapping_path: PathBuf,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn ws(&self, slot: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/{slot}", self.port)
    }
}

/// Spin up a server on its own port with its own copy of the given mapping
/// document.
pub async fn start_server(mapping_document: &str) -> TestServer {
    let dir = std::env::temp_dir().join(format!("slotline-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join("logs")).expect("Test dirs are creatable");

    let mapping_path = dir.join("devices.json");
    std::fs::write(&mapping_path, mapping_document).expect("Test mapping is writable");

    let config = Config {
        mapping_path: mapping_path.clone(),
        log_dir: dir.join("logs"),
        strips: None,
    };

    let (port_tx, port_rx) = oneshot::channel();
    tokio::spawn(async move { slotline::server::run_any_port(config, port_tx).await });

    let port = port_rx
        .await
        .expect("Server should reply with allocated port");

    TestServer { port, mapping_path }
}

pub async fn connect(
    server: &TestServer,
    slot: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let (stream, http_response) = tokio_tungstenite::connect_async(server.ws(slot)).await?;

    assert_eq!(
        http_response.status(),
        axum::http::StatusCode::SWITCHING_PROTOCOLS
    );

    Ok(stream)
}

pub async fn receive(
    client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> Result<tungstenite::Message> {
    let message = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    Ok(message)
}
