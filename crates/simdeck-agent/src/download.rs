//! Download confirmation bridge.
//!
//! The profile engine drives a download through blocking-style callbacks
//! ("show this profile, may I continue?"). The user answers asynchronously
//! over a WebSocket. [`DownloadBridge`] sits in between: a background reader
//! drains client frames into single-slot channels, and the callbacks wait on
//! those channels, the cancellation token and the disconnect signal.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use simdeck_common::models::Device;
use simdeck_common::protocol::{ClientMessageType, DownloadClientMessage, DownloadServerMessage};

use crate::error::{Error, Result};
use crate::lpa::client::{ActivationCode, DownloadCallbacks, DownloadStage, ProfileInfo};
use crate::service::ProvisioningService;

/// Client frames as the transport decoded them. A decode failure ends the
/// session like a closed socket does.
pub type ClientMessages = BoxStream<'static, Result<DownloadClientMessage>>;

/// Outgoing half of the transport.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: &DownloadServerMessage) -> Result<()>;
}

// ── Start message ───────────────────────────────────────────────────

/// Read and validate the first frame, which must be a `start`.
pub async fn read_start(messages: &mut ClientMessages) -> Result<DownloadClientMessage> {
    let start = match messages.next().await {
        Some(frame) => frame?,
        None => return Err(Error::Disconnected),
    };
    if start.message_type() != ClientMessageType::Start {
        return Err(Error::InvalidInput(format!(
            "unexpected message type {:?}",
            start.kind
        )));
    }
    if start.smdp.trim().is_empty() {
        return Err(Error::InvalidInput("smdp is required".into()));
    }
    if start.activation_code.trim().is_empty() {
        return Err(Error::InvalidInput("activationCode is required".into()));
    }
    Ok(start)
}

/// Build the activation code for a validated start frame.
pub fn activation_code(start: &DownloadClientMessage, imei: &str) -> Result<ActivationCode> {
    let confirmation_code = start.confirmation_code.trim();
    Ok(ActivationCode {
        smdp: normalize_smdp(&start.smdp)?,
        matching_id: start.activation_code.trim().to_string(),
        imei: imei.to_string(),
        confirmation_code: (!confirmation_code.is_empty()).then(|| confirmation_code.to_string()),
    })
}

/// Reduce an SM-DP+ address to `https://host[:port]`.
///
/// Bare hosts are accepted; any scheme, path or query is discarded.
pub fn normalize_smdp(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("smdp is required".into()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let invalid = || Error::InvalidInput(format!("invalid smdp {raw:?}"));
    let parsed = Url::parse(&candidate).map_err(|_| invalid())?;
    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

    let mut smdp = Url::parse(&format!("https://{host}")).map_err(|_| invalid())?;
    if let Some(port) = parsed.port() {
        smdp.set_port(Some(port)).map_err(|_| invalid())?;
    }
    Ok(smdp)
}

/// Send one error frame on a socket that never got as far as a bridge.
pub async fn reject(sink: &mut dyn MessageSink, error: &Error) {
    if let Err(e) = sink.send(&DownloadServerMessage::error(error.to_string())).await {
        tracing::debug!(error = %e, "failed to send download rejection");
    }
}

/// Run one download request over an already established socket: read the
/// start frame, bridge the engine's callbacks to the client, and report the
/// outcome.
pub async fn serve(
    service: &ProvisioningService,
    device: &Device,
    mut sink: Box<dyn MessageSink>,
    mut messages: ClientMessages,
) {
    let identity = device.equipment_identifier.as_str();
    let activation = match read_start(&mut messages)
        .await
        .and_then(|start| activation_code(&start, identity))
    {
        Ok(activation) => activation,
        Err(e) => {
            tracing::info!(modem = %identity, error = %e, "download request rejected");
            reject(sink.as_mut(), &e).await;
            return;
        }
    };

    let cancel = CancellationToken::new();
    let bridge = DownloadBridge::start(sink, messages, cancel.clone());
    tracing::info!(
        modem = %identity,
        session = %bridge.id(),
        smdp = %activation.smdp,
        "download requested"
    );
    let outcome = service
        .download_profile(device, &activation, cancel, &bridge)
        .await;
    bridge.finish(outcome).await;
}

// ── Bridge ──────────────────────────────────────────────────────────

pub struct DownloadBridge {
    id: String,
    sink: Mutex<Box<dyn MessageSink>>,
    cancel: CancellationToken,
    disconnected: CancellationToken,
    confirm_rx: Mutex<mpsc::Receiver<bool>>,
    code_rx: Mutex<mpsc::Receiver<String>>,
    reader: JoinHandle<()>,
}

impl DownloadBridge {
    /// Start draining `messages` in the background.
    ///
    /// A `cancel` frame or the end of `messages` cancels `cancel`; the caller
    /// hands the same token to the engine.
    pub fn start(
        sink: Box<dyn MessageSink>,
        messages: ClientMessages,
        cancel: CancellationToken,
    ) -> Self {
        let id = Uuid::now_v7().to_string();
        let disconnected = CancellationToken::new();
        let (confirm_tx, confirm_rx) = mpsc::channel(1);
        let (code_tx, code_rx) = mpsc::channel(1);

        let reader = tokio::spawn(read_loop(
            id.clone(),
            messages,
            confirm_tx,
            code_tx,
            cancel.clone(),
            disconnected.clone(),
        ));
        tracing::debug!(session = %id, "download session started");

        Self {
            id,
            sink: Mutex::new(sink),
            cancel,
            disconnected,
            confirm_rx: Mutex::new(confirm_rx),
            code_rx: Mutex::new(code_rx),
            reader,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_cancelled()
    }

    async fn send(&self, message: &DownloadServerMessage) -> Result<()> {
        let result = self.sink.lock().await.send(message).await;
        if let Err(e) = &result {
            tracing::debug!(session = %self.id, error = %e, "download client write failed");
            self.disconnected.cancel();
        }
        result
    }

    async fn send_if_connected(&self, message: &DownloadServerMessage) {
        if self.is_disconnected() {
            return;
        }
        let _ = self.send(message).await;
    }

    /// Take a queued answer, or wait for one until cancelled or disconnected.
    async fn wait_for<T>(&self, rx: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
        let mut rx = rx.lock().await;
        if let Ok(answer) = rx.try_recv() {
            return Some(answer);
        }
        tokio::select! {
            biased;
            answer = rx.recv() => answer,
            _ = self.cancel.cancelled() => None,
            _ = self.disconnected.cancelled() => None,
        }
    }

    /// Report the outcome. Nothing is sent to a client that already left.
    pub async fn finish(self, outcome: Result<()>) {
        let message = match &outcome {
            Ok(()) => DownloadServerMessage::completed(),
            Err(e) => DownloadServerMessage::error(e.to_string()),
        };
        if self.is_disconnected() {
            tracing::info!(session = %self.id, ok = outcome.is_ok(), "download finished after client left");
            return;
        }
        match &outcome {
            Ok(()) => tracing::info!(session = %self.id, "download completed"),
            Err(e) => tracing::warn!(session = %self.id, error = %e, "download failed"),
        }
        let _ = self.send(&message).await;
    }
}

impl Drop for DownloadBridge {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    id: String,
    mut messages: ClientMessages,
    confirm_tx: mpsc::Sender<bool>,
    code_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    disconnected: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = messages.next() => frame,
            _ = disconnected.cancelled() => break,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::debug!(session = %id, error = %e, "download client read failed");
                break;
            }
            None => break,
        };
        match message.message_type() {
            ClientMessageType::Confirm => {
                if let Some(accept) = message.accept {
                    // A second answer while one is pending is dropped.
                    let _ = confirm_tx.try_send(accept);
                }
            }
            ClientMessageType::ConfirmationCode => {
                let _ = code_tx.try_send(message.code);
            }
            ClientMessageType::Cancel => {
                tracing::info!(session = %id, "download cancelled by client");
                cancel.cancel();
            }
            ClientMessageType::Start | ClientMessageType::Unknown => {}
        }
    }
    disconnected.cancel();
    // A download without its client is abandoned, including a wait for a
    // busy modem.
    cancel.cancel();
    tracing::debug!(session = %id, "download client gone");
}

#[async_trait]
impl DownloadCallbacks for DownloadBridge {
    async fn on_progress(&self, stage: DownloadStage) {
        self.send_if_connected(&DownloadServerMessage::progress(stage.to_string()))
            .await;
    }

    async fn on_confirm(&self, profile: &ProfileInfo) -> bool {
        if self
            .send(&DownloadServerMessage::preview(profile.preview()))
            .await
            .is_err()
        {
            return false;
        }
        self.wait_for(&self.confirm_rx).await.unwrap_or(false)
    }

    async fn on_enter_confirmation_code(&self) -> String {
        self.send_if_connected(&DownloadServerMessage::confirmation_code_required())
            .await;
        self.wait_for(&self.code_rx)
            .await
            .map(|code| code.trim().to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use simdeck_common::protocol::ServerMessageType;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::simulate::sample_profile;

    struct ChannelSink {
        tx: UnboundedSender<DownloadServerMessage>,
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageSink for ChannelSink {
        async fn send(&mut self, message: &DownloadServerMessage) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(Error::Disconnected);
            }
            self.tx.send(message.clone()).map_err(|_| Error::Disconnected)
        }
    }

    struct Harness {
        bridge: DownloadBridge,
        client: UnboundedSender<Result<DownloadClientMessage>>,
        server: UnboundedReceiver<DownloadServerMessage>,
        broken: Arc<AtomicBool>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        let (server_tx, server) = unbounded_channel();
        let (client, client_rx) = unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let bridge = DownloadBridge::start(
            Box::new(ChannelSink {
                tx: server_tx,
                broken: broken.clone(),
            }),
            UnboundedReceiverStream::new(client_rx).boxed(),
            cancel.clone(),
        );
        Harness {
            bridge,
            client,
            server,
            broken,
            cancel,
        }
    }

    fn profile() -> ProfileInfo {
        sample_profile("8944000100000000011", "Roaming").unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn confirm_after_preview_continues() {
        let mut h = harness();
        let client = h.client.clone();
        let answer = tokio::spawn(async move {
            let profile = profile();
            let accepted = h.bridge.on_confirm(&profile).await;
            (accepted, h.bridge)
        });

        let preview = h.server.recv().await.unwrap();
        assert_eq!(preview.kind, ServerMessageType::Preview);
        assert_eq!(preview.profile.unwrap().profile_name, "Roaming");
        client.send(Ok(DownloadClientMessage::confirm(true))).unwrap();

        let (accepted, bridge) = answer.await.unwrap();
        assert!(accepted);
        bridge.finish(Ok(())).await;
        assert_eq!(h.server.recv().await.unwrap().kind, ServerMessageType::Completed);
    }

    #[tokio::test]
    async fn answer_sent_before_preview_is_taken() {
        let mut h = harness();
        h.client.send(Ok(DownloadClientMessage::confirm(true))).unwrap();
        settle().await;
        assert!(h.bridge.on_confirm(&profile()).await);
        assert_eq!(h.server.recv().await.unwrap().kind, ServerMessageType::Preview);
    }

    #[tokio::test]
    async fn second_pending_answer_is_dropped() {
        let h = harness();
        h.client.send(Ok(DownloadClientMessage::confirm(false))).unwrap();
        h.client.send(Ok(DownloadClientMessage::confirm(true))).unwrap();
        settle().await;
        assert!(!h.bridge.on_confirm(&profile()).await);
    }

    #[tokio::test]
    async fn confirm_without_accept_is_ignored() {
        let h = harness();
        h.client
            .send(Ok(DownloadClientMessage {
                kind: "confirm".into(),
                ..Default::default()
            }))
            .unwrap();
        h.client.send(Ok(DownloadClientMessage::confirm(true))).unwrap();
        settle().await;
        assert!(h.bridge.on_confirm(&profile()).await);
    }

    #[tokio::test]
    async fn disconnect_while_waiting_declines_and_suppresses_terminal() {
        let mut h = harness();
        let client = h.client;
        let waiting = tokio::spawn(async move {
            let accepted = h.bridge.on_confirm(&profile()).await;
            (accepted, h.bridge)
        });
        assert_eq!(h.server.recv().await.unwrap().kind, ServerMessageType::Preview);
        drop(client);

        let (accepted, bridge) = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(!accepted);
        assert!(bridge.is_disconnected());

        bridge.finish(Err(Error::Cancelled)).await;
        assert!(h.server.try_recv().is_err());
        assert!(h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn disconnect_while_waiting_for_code_returns_empty() {
        let mut h = harness();
        let client = h.client;
        let waiting = tokio::spawn(async move {
            let code = h.bridge.on_enter_confirmation_code().await;
            (code, h.bridge)
        });
        assert_eq!(
            h.server.recv().await.unwrap().kind,
            ServerMessageType::ConfirmationCodeRequired
        );
        drop(client);

        let (code, bridge) = tokio::time::timeout(Duration::from_millis(200), waiting)
            .await
            .expect("code prompt outlived the disconnect")
            .unwrap();
        assert_eq!(code, "");
        assert!(bridge.is_disconnected());
    }

    #[tokio::test]
    async fn cancel_frame_while_waiting_for_code_returns_empty() {
        let mut h = harness();
        let client = h.client.clone();
        let waiting = tokio::spawn(async move {
            let code = h.bridge.on_enter_confirmation_code().await;
            (code, h.bridge)
        });
        assert_eq!(
            h.server.recv().await.unwrap().kind,
            ServerMessageType::ConfirmationCodeRequired
        );
        client.send(Ok(DownloadClientMessage::cancel())).unwrap();

        let (code, bridge) = tokio::time::timeout(Duration::from_millis(200), waiting)
            .await
            .expect("code prompt outlived the cancel")
            .unwrap();
        assert_eq!(code, "");
        assert!(h.cancel.is_cancelled());
        assert!(!bridge.is_disconnected());
    }

    #[tokio::test]
    async fn cancel_frame_cancels_token_and_declines() {
        let mut h = harness();
        let client = h.client.clone();
        let waiting = tokio::spawn(async move {
            let accepted = h.bridge.on_confirm(&profile()).await;
            (accepted, h.bridge)
        });
        h.server.recv().await.unwrap();
        client.send(Ok(DownloadClientMessage::cancel())).unwrap();

        let (accepted, bridge) = waiting.await.unwrap();
        assert!(!accepted);
        assert!(h.cancel.is_cancelled());
        assert!(!bridge.is_disconnected());
    }

    #[tokio::test]
    async fn malformed_frame_counts_as_disconnect() {
        let h = harness();
        h.client
            .send(Err(Error::Protocol("expected value at line 1".into())))
            .unwrap();
        settle().await;
        assert!(h.bridge.is_disconnected());
        assert!(!h.bridge.on_confirm(&profile()).await);
    }

    #[tokio::test]
    async fn confirmation_code_is_trimmed() {
        let mut h = harness();
        h.client
            .send(Ok(DownloadClientMessage::confirmation_code("  4321 \n")))
            .unwrap();
        settle().await;
        assert_eq!(h.bridge.on_enter_confirmation_code().await, "4321");
        assert_eq!(
            h.server.recv().await.unwrap().kind,
            ServerMessageType::ConfirmationCodeRequired
        );
    }

    #[tokio::test]
    async fn write_failure_marks_disconnected() {
        let mut h = harness();
        h.broken.store(true, Ordering::SeqCst);
        assert!(!h.bridge.on_confirm(&profile()).await);
        assert!(h.bridge.is_disconnected());

        // Progress after a disconnect is silently skipped.
        h.broken.store(false, Ordering::SeqCst);
        h.bridge.on_progress(DownloadStage::Install).await;
        assert!(h.server.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_is_reported_once() {
        let mut h = harness();
        h.bridge.on_progress(DownloadStage::AuthenticateClient).await;
        h.bridge
            .finish(Err(Error::Protocol("matching id refused".into())))
            .await;

        let progress = h.server.recv().await.unwrap();
        assert_eq!(progress.stage.as_deref(), Some("Authenticating Client"));
        let terminal = h.server.recv().await.unwrap();
        assert_eq!(terminal.kind, ServerMessageType::Error);
        assert_eq!(terminal.message.as_deref(), Some("matching id refused"));
        assert!(h.server.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_start_validates_fields() {
        let (tx, rx) = unbounded_channel();
        let mut messages: ClientMessages = UnboundedReceiverStream::new(rx).boxed();

        tx.send(Ok(DownloadClientMessage::start("rsp.example.com", ""))).unwrap();
        let err = read_start(&mut messages).await.unwrap_err();
        assert_eq!(err.to_string(), "activationCode is required");

        tx.send(Ok(DownloadClientMessage::confirm(true))).unwrap();
        assert!(matches!(read_start(&mut messages).await, Err(Error::InvalidInput(_))));

        let mut untyped = DownloadClientMessage::start("rsp.example.com", "ABC");
        untyped.kind.clear();
        tx.send(Ok(untyped)).unwrap();
        assert_eq!(read_start(&mut messages).await.unwrap().activation_code, "ABC");

        drop(tx);
        assert!(matches!(read_start(&mut messages).await, Err(Error::Disconnected)));
    }

    #[test]
    fn smdp_is_reduced_to_origin() {
        let cases = [
            ("rsp.example.com", "https://rsp.example.com"),
            ("  https://rsp.example.com/path?x=1 ", "https://rsp.example.com"),
            ("http://rsp.example.com:8443", "https://rsp.example.com:8443"),
            ("rsp.example.com:443", "https://rsp.example.com"),
        ];
        for (raw, expected) in cases {
            let url = normalize_smdp(raw).unwrap();
            assert_eq!(url.origin().ascii_serialization(), expected, "{raw}");
        }
        assert!(normalize_smdp("   ").is_err());
        assert!(normalize_smdp("https://").is_err());
    }

    #[test]
    fn activation_code_trims_and_drops_empty_code() {
        let mut start = DownloadClientMessage::start("rsp.example.com", "  ABC-123 ");
        start.confirmation_code = "   ".into();
        let code = activation_code(&start, "860000000000001").unwrap();
        assert_eq!(code.matching_id, "ABC-123");
        assert_eq!(code.imei, "860000000000001");
        assert!(code.confirmation_code.is_none());
    }
}
