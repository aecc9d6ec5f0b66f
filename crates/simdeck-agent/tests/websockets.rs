//! WebSocket endpoints over a real socket.
//!
//! Spins up the agent router on an ephemeral port against the simulated
//! demo hardware and drives the download conversation and the inventory
//! stream with a tungstenite client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use simdeck_agent::config::SettingsStore;
use simdeck_agent::lpa::{SessionFactory, SessionOptions};
use simdeck_agent::modem::registry::Registry;
use simdeck_agent::service::ProvisioningService;
use simdeck_agent::simulate::{
    self, modem_properties, SimulatedBus, DEMO_CONFIRMATION_CODE, DEMO_MATCHING_ID,
    DEMO_MATCHING_ID_WITH_CODE,
};
use simdeck_agent::state::AppState;
use simdeck_common::protocol::{
    DownloadClientMessage, DownloadServerMessage, Envelope, ServerMessageType, SnapshotPayload,
};

const MODEM: &str = "860000000000101";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    state: AppState,
    bus: SimulatedBus,
}

async fn start_server() -> Server {
    let hardware = simulate::demo().unwrap();
    let sessions = SessionFactory::new(
        Arc::new(hardware.driver.clone()),
        Arc::new(hardware.engine.clone()),
        SessionOptions::default(),
    );
    let service = ProvisioningService::new(
        Registry::new(Arc::new(hardware.bus.clone())),
        Some(sessions),
        SettingsStore::default(),
        Duration::from_secs(5),
    );
    let state = AppState::new(service);
    state.start_inventory_relay().await.unwrap();
    let app = Router::new()
        .nest("/api", simdeck_agent::api::router())
        .route("/ws", axum::routing::get(simdeck_agent::ws_inventory::handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    Server {
        addr,
        state,
        bus: hardware.bus,
    }
}

async fn connect(server: &Server, modem: &str) -> Client {
    let url = format!("ws://{}/api/modems/{modem}/esims/download", server.addr);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, message: DownloadClientMessage) {
    let json = serde_json::to_string(&message).unwrap();
    ws.send(Message::text(json)).await.unwrap();
}

/// Next server message, skipping control frames. `None` once the socket
/// closes.
async fn next_message(ws: &mut Client) -> Option<DownloadServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")?;
        match frame {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Collect progress stages until a message of another kind arrives.
async fn skip_progress(ws: &mut Client) -> (Vec<String>, DownloadServerMessage) {
    let mut stages = Vec::new();
    loop {
        let message = next_message(ws).await.expect("socket closed early");
        if message.kind != ServerMessageType::Progress {
            return (stages, message);
        }
        stages.extend(message.stage);
    }
}

async fn profile_names(server: &Server) -> Vec<String> {
    server
        .state
        .service()
        .list_profiles(MODEM)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect()
}

#[tokio::test]
async fn download_with_preview_confirmation() {
    let server = start_server().await;
    let mut ws = connect(&server, MODEM).await;

    send(
        &mut ws,
        DownloadClientMessage::start("rsp.example.com", DEMO_MATCHING_ID),
    )
    .await;

    let (stages, preview) = skip_progress(&mut ws).await;
    assert_eq!(stages.len(), 2, "{stages:?}");
    assert_eq!(preview.kind, ServerMessageType::Preview);
    assert_eq!(preview.profile.as_ref().unwrap().profile_name, "Roaming");

    send(&mut ws, DownloadClientMessage::confirm(true)).await;
    let (stages, done) = skip_progress(&mut ws).await;
    assert_eq!(stages.len(), 1, "{stages:?}");
    assert_eq!(done.kind, ServerMessageType::Completed);

    assert!(profile_names(&server).await.contains(&"Roaming".to_string()));
}

#[tokio::test]
async fn download_asks_for_confirmation_code() {
    let server = start_server().await;
    let mut ws = connect(&server, MODEM).await;

    send(
        &mut ws,
        DownloadClientMessage::start("https://rsp.example.com/", DEMO_MATCHING_ID_WITH_CODE),
    )
    .await;

    let (_, asked) = skip_progress(&mut ws).await;
    assert_eq!(asked.kind, ServerMessageType::ConfirmationCodeRequired);

    send(
        &mut ws,
        DownloadClientMessage::confirmation_code(format!(" {DEMO_CONFIRMATION_CODE} ")),
    )
    .await;
    let (_, preview) = skip_progress(&mut ws).await;
    assert_eq!(preview.kind, ServerMessageType::Preview);
    assert_eq!(preview.profile.unwrap().profile_name, "Business");

    send(&mut ws, DownloadClientMessage::confirm(true)).await;
    let (_, done) = skip_progress(&mut ws).await;
    assert_eq!(done.kind, ServerMessageType::Completed);
}

#[tokio::test]
async fn declined_preview_is_an_error() {
    let server = start_server().await;
    let mut ws = connect(&server, MODEM).await;

    send(
        &mut ws,
        DownloadClientMessage::start("rsp.example.com", DEMO_MATCHING_ID),
    )
    .await;
    let (_, preview) = skip_progress(&mut ws).await;
    assert_eq!(preview.kind, ServerMessageType::Preview);

    send(&mut ws, DownloadClientMessage::confirm(false)).await;
    let (_, outcome) = skip_progress(&mut ws).await;
    assert_eq!(outcome.kind, ServerMessageType::Error);
    assert!(outcome.message.unwrap().contains("cancelled"));

    assert!(!profile_names(&server).await.contains(&"Roaming".to_string()));
}

#[tokio::test]
async fn unknown_matching_id_is_an_error() {
    let server = start_server().await;
    let mut ws = connect(&server, MODEM).await;

    send(
        &mut ws,
        DownloadClientMessage::start("rsp.example.com", "NOPE"),
    )
    .await;
    let (_, outcome) = skip_progress(&mut ws).await;
    assert_eq!(outcome.kind, ServerMessageType::Error);
    assert!(outcome.message.unwrap().contains("matching id refused"));
}

#[tokio::test]
async fn missing_activation_code_is_rejected() {
    let server = start_server().await;
    let mut ws = connect(&server, MODEM).await;

    send(&mut ws, DownloadClientMessage::start("rsp.example.com", "  ")).await;
    let outcome = next_message(&mut ws).await.unwrap();
    assert_eq!(outcome.kind, ServerMessageType::Error);
    assert_eq!(outcome.message.as_deref(), Some("activationCode is required"));
}

#[tokio::test]
async fn closing_mid_download_leaves_card_untouched() {
    let server = start_server().await;
    let mut ws = connect(&server, MODEM).await;

    send(
        &mut ws,
        DownloadClientMessage::start("rsp.example.com", DEMO_MATCHING_ID),
    )
    .await;
    let (_, preview) = skip_progress(&mut ws).await;
    assert_eq!(preview.kind, ServerMessageType::Preview);
    ws.close(None).await.unwrap();

    // Listing waits for the download session to let go of the modem.
    let names = tokio::time::timeout(Duration::from_secs(5), profile_names(&server))
        .await
        .expect("download session was never released");
    assert_eq!(names.len(), 2, "{names:?}");
    assert!(!names.contains(&"Roaming".to_string()));
}

#[tokio::test]
async fn unknown_modem_refuses_upgrade() {
    let server = start_server().await;
    let url = format!(
        "ws://{}/api/modems/000000000000000/esims/download",
        server.addr
    );
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

// ── Inventory stream ────────────────────────────────────────────────

async fn next_envelope(ws: &mut Client) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for inventory event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn inventory_stream_sends_snapshot_then_hotplug() {
    let server = start_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();

    let snapshot = next_envelope(&mut ws).await;
    assert_eq!(snapshot.msg_type, "modem.snapshot");
    let payload: SnapshotPayload = snapshot.parse_payload().unwrap();
    assert_eq!(payload.modems.len(), 2);

    let path = server
        .bus
        .plug(modem_properties("860000000000303", "ttyUSB5", 3));
    let added = next_envelope(&mut ws).await;
    assert_eq!(added.msg_type, "modem.added");
    assert_eq!(added.payload["modem"]["equipmentIdentifier"], "860000000000303");

    server.bus.unplug(&path);
    let removed = next_envelope(&mut ws).await;
    assert_eq!(removed.msg_type, "modem.removed");
    assert_eq!(removed.payload["path"], path.as_str());
}
