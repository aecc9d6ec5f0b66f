//! In-memory channel driver, profile engine and eUICC.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use simdeck_common::models::{Iccid, NotificationOperation, ProfileState, SequenceNumber};

use crate::error::{Error, Result};
use crate::lpa::client::{
    ActivationCode, ClientOptions, DownloadCallbacks, DownloadResult, DownloadStage, EuiccInfo,
    EventEntry, NotificationMetadata, PendingNotification, ProfileClient, ProfileEngine, ProfileIcon,
    ProfileInfo,
};
use crate::lpa::driver::{ChannelDriver, SecureElementChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Channel driver ──────────────────────────────────────────────────

#[derive(Default)]
struct DriverState {
    /// `(protocol, port, slot)` of every open call.
    opened: Vec<(String, String, u32)>,
    live: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    failing: HashSet<String>,
}

/// Opens [`SimulatedChannel`]s and tracks how many are live per port.
#[derive(Clone, Default)]
pub struct SimulatedDriver {
    state: Arc<Mutex<DriverState>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every open on `port` fail.
    pub fn fail_port(&self, port: &str) {
        lock(&self.state).failing.insert(port.to_string());
    }

    pub fn opened(&self) -> Vec<(String, String, u32)> {
        lock(&self.state).opened.clone()
    }

    pub fn live_channels(&self, port: &str) -> usize {
        lock(&self.state).live.get(port).copied().unwrap_or(0)
    }

    /// Highest number of channels ever open on `port` at the same time.
    pub fn peak_channels(&self, port: &str) -> usize {
        lock(&self.state).peak.get(port).copied().unwrap_or(0)
    }

    fn open(&self, protocol: &str, port: &str, slot: u32) -> Result<Arc<dyn SecureElementChannel>> {
        let mut state = lock(&self.state);
        state
            .opened
            .push((protocol.to_string(), port.to_string(), slot));
        if state.failing.contains(port) {
            return Err(Error::Channel(format!("opening {port}: device busy")));
        }
        let live = {
            let live = state.live.entry(port.to_string()).or_insert(0);
            *live += 1;
            *live
        };
        let peak = state.peak.entry(port.to_string()).or_insert(0);
        *peak = (*peak).max(live);
        Ok(Arc::new(SimulatedChannel {
            port: port.to_string(),
            closed: AtomicBool::new(false),
            driver: self.state.clone(),
        }))
    }
}

#[async_trait]
impl ChannelDriver for SimulatedDriver {
    async fn open_at(&self, port: &str) -> Result<Arc<dyn SecureElementChannel>> {
        self.open("at", port, 0)
    }

    async fn open_qmi(&self, port: &str, slot: u32) -> Result<Arc<dyn SecureElementChannel>> {
        self.open("qmi", port, slot)
    }

    async fn open_mbim(&self, port: &str, slot: u32) -> Result<Arc<dyn SecureElementChannel>> {
        self.open("mbim", port, slot)
    }
}

pub struct SimulatedChannel {
    port: String,
    closed: AtomicBool,
    driver: Arc<Mutex<DriverState>>,
}

#[async_trait]
impl SecureElementChannel for SimulatedChannel {
    async fn transmit(&self, _command: &[u8]) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Channel("channel closed".into()));
        }
        Ok(vec![0x90, 0x00])
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(live) = lock(&self.driver).live.get_mut(&self.port) {
                *live = live.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn port(&self) -> &str {
        &self.port
    }
}

// ── eUICC ───────────────────────────────────────────────────────────

/// A profile the simulated SM-DP+ will hand out for a matching id.
#[derive(Debug, Clone)]
pub struct Offer {
    pub profile: ProfileInfo,
    pub confirmation_code: Option<String>,
}

struct CardState {
    eid: String,
    profiles: Vec<ProfileInfo>,
    notifications: Vec<NotificationMetadata>,
    next_sequence: SequenceNumber,
    failing_sequences: HashSet<SequenceNumber>,
    handled: Vec<SequenceNumber>,
    offers: HashMap<String, Offer>,
    install_failure: Option<String>,
    /// Discovery events keyed by SM-DS host.
    events: HashMap<String, Vec<EventEntry>>,
    unreachable_smds: HashSet<String>,
}

/// eUICC contents shared by every client connected to it.
#[derive(Clone)]
pub struct SimulatedEuicc {
    state: Arc<Mutex<CardState>>,
}

impl SimulatedEuicc {
    pub fn new(eid: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                eid: eid.into(),
                profiles: Vec::new(),
                notifications: Vec::new(),
                next_sequence: 1,
                failing_sequences: HashSet::new(),
                handled: Vec::new(),
                offers: HashMap::new(),
                install_failure: None,
                events: HashMap::new(),
                unreachable_smds: HashSet::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, CardState> {
        lock(&self.state)
    }

    pub fn add_profile(&self, profile: ProfileInfo) {
        self.state().profiles.push(profile);
    }

    pub fn profiles(&self) -> Vec<ProfileInfo> {
        self.state().profiles.clone()
    }

    /// Queue a notification as if the card had produced it.
    pub fn push_notification(
        &self,
        iccid: &Iccid,
        operation: NotificationOperation,
        smdp: &str,
    ) -> SequenceNumber {
        let mut state = self.state();
        Self::record(&mut state, iccid, operation, smdp)
    }

    fn record(
        state: &mut CardState,
        iccid: &Iccid,
        operation: NotificationOperation,
        smdp: &str,
    ) -> SequenceNumber {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.notifications.push(NotificationMetadata {
            sequence_number: sequence,
            iccid: iccid.clone(),
            smdp: smdp.to_string(),
            operation,
        });
        sequence
    }

    pub fn notifications(&self) -> Vec<NotificationMetadata> {
        self.state().notifications.clone()
    }

    /// Make delivery of `sequence` fail.
    pub fn fail_notification(&self, sequence: SequenceNumber) {
        self.state().failing_sequences.insert(sequence);
    }

    /// Sequence numbers delivered so far, in order.
    pub fn handled(&self) -> Vec<SequenceNumber> {
        self.state().handled.clone()
    }

    pub fn add_offer(&self, matching_id: &str, offer: Offer) {
        self.state().offers.insert(matching_id.to_string(), offer);
    }

    /// Register a pending download on the SM-DS at `smds_host`.
    pub fn add_event(&self, smds_host: &str, event_id: &str, rsp_server_address: &str) {
        self.state()
            .events
            .entry(smds_host.to_string())
            .or_default()
            .push(EventEntry {
                event_id: event_id.to_string(),
                rsp_server_address: rsp_server_address.to_string(),
            });
    }

    /// Make discovery against `smds_host` fail.
    pub fn fail_smds(&self, smds_host: &str) {
        self.state().unreachable_smds.insert(smds_host.to_string());
    }

    /// Make the next download fail after the profile was installed.
    pub fn fail_after_install(&self, message: impl Into<String>) {
        self.state().install_failure = Some(message.into());
    }
}

/// Default SM-DP+ the simulated profiles come from.
pub const SIMULATED_SMDP: &str = "rsp.simulated.example";

struct SimulatedClient {
    card: SimulatedEuicc,
    channel: Arc<dyn SecureElementChannel>,
}

#[async_trait]
impl ProfileClient for SimulatedClient {
    async fn list_notification(
        &self,
        filter: Option<NotificationOperation>,
    ) -> Result<Vec<NotificationMetadata>> {
        Ok(self
            .card
            .state()
            .notifications
            .iter()
            .filter(|n| filter.is_none_or(|op| n.operation == op))
            .cloned()
            .collect())
    }

    async fn retrieve_notification_list(
        &self,
        sequence: SequenceNumber,
    ) -> Result<Vec<PendingNotification>> {
        Ok(self
            .card
            .state()
            .notifications
            .iter()
            .filter(|n| n.sequence_number == sequence)
            .map(|n| PendingNotification {
                sequence_number: n.sequence_number,
                payload: format!("{}:{}:{}", n.operation, n.iccid, n.sequence_number).into_bytes(),
            })
            .collect())
    }

    async fn handle_notification(&self, notification: &PendingNotification) -> Result<()> {
        let mut state = self.card.state();
        if state
            .failing_sequences
            .contains(&notification.sequence_number)
        {
            return Err(Error::Protocol(format!(
                "SM-DP+ rejected notification {}",
                notification.sequence_number
            )));
        }
        state.handled.push(notification.sequence_number);
        Ok(())
    }

    async fn remove_notification_from_list(&self, sequence: SequenceNumber) -> Result<()> {
        let mut state = self.card.state();
        let before = state.notifications.len();
        state.notifications.retain(|n| n.sequence_number != sequence);
        if state.notifications.len() == before {
            return Err(Error::Protocol(format!("notification {sequence} not found")));
        }
        Ok(())
    }

    async fn list_profile(&self) -> Result<Vec<ProfileInfo>> {
        Ok(self.card.profiles())
    }

    async fn enable_profile(&self, iccid: &Iccid, _refresh: bool) -> Result<()> {
        let mut state = self.card.state();
        let target = state
            .profiles
            .iter()
            .position(|p| &p.iccid == iccid)
            .ok_or_else(|| Error::Protocol(format!("profile {iccid} not found")))?;
        if state.profiles[target].state == ProfileState::Enabled {
            return Err(Error::Protocol(format!("profile {iccid} is already enabled")));
        }
        let previous = state
            .profiles
            .iter()
            .position(|p| p.state == ProfileState::Enabled);
        if let Some(previous) = previous {
            state.profiles[previous].state = ProfileState::Disabled;
            let old = state.profiles[previous].iccid.clone();
            SimulatedEuicc::record(&mut state, &old, NotificationOperation::Disable, SIMULATED_SMDP);
        }
        state.profiles[target].state = ProfileState::Enabled;
        SimulatedEuicc::record(&mut state, iccid, NotificationOperation::Enable, SIMULATED_SMDP);
        Ok(())
    }

    async fn delete_profile(&self, iccid: &Iccid) -> Result<()> {
        let mut state = self.card.state();
        let index = state
            .profiles
            .iter()
            .position(|p| &p.iccid == iccid)
            .ok_or_else(|| Error::Protocol(format!("profile {iccid} not found")))?;
        if state.profiles[index].state == ProfileState::Enabled {
            return Err(Error::Protocol(format!("profile {iccid} is enabled")));
        }
        state.profiles.remove(index);
        SimulatedEuicc::record(&mut state, iccid, NotificationOperation::Delete, SIMULATED_SMDP);
        Ok(())
    }

    async fn set_nickname(&self, iccid: &Iccid, nickname: &str) -> Result<()> {
        let mut state = self.card.state();
        let profile = state
            .profiles
            .iter_mut()
            .find(|p| &p.iccid == iccid)
            .ok_or_else(|| Error::Protocol(format!("profile {iccid} not found")))?;
        profile.nickname = Some(nickname.to_string()).filter(|n| !n.is_empty());
        Ok(())
    }

    async fn euicc_info(&self) -> Result<EuiccInfo> {
        let state = self.card.state();
        Ok(EuiccInfo {
            eid: state.eid.clone(),
            free_space: 412_000 - 30_000 * state.profiles.len() as i32,
            sas_accreditation_number: "GI-BA-UP-0419".into(),
            certificates: vec!["GSMA Test CI".into()],
        })
    }

    async fn discover(&self, smds: &Url, _imei: &str) -> Result<Vec<EventEntry>> {
        let host = smds.host_str().unwrap_or_default();
        let state = self.card.state();
        if state.unreachable_smds.contains(host) {
            return Err(Error::Protocol(format!("{host}: connection refused")));
        }
        Ok(state.events.get(host).cloned().unwrap_or_default())
    }

    async fn download(
        &self,
        cancel: CancellationToken,
        activation: &ActivationCode,
        callbacks: &dyn DownloadCallbacks,
    ) -> DownloadResult {
        let failed = |outcome: Error| DownloadResult {
            notification: None,
            outcome: Err(outcome),
        };

        callbacks.on_progress(DownloadStage::AuthenticateClient).await;
        if cancel.is_cancelled() {
            return failed(Error::Cancelled);
        }
        let offer = self
            .card
            .state()
            .offers
            .get(&activation.matching_id)
            .cloned();
        let Some(offer) = offer else {
            return failed(Error::Protocol(format!(
                "{}: matching id refused",
                activation.smdp
            )));
        };

        callbacks.on_progress(DownloadStage::AuthenticateServer).await;
        if let Some(expected) = &offer.confirmation_code {
            let code = match &activation.confirmation_code {
                Some(code) if !code.is_empty() => code.clone(),
                _ => callbacks.on_enter_confirmation_code().await,
            };
            if code.is_empty() {
                return failed(Error::Cancelled);
            }
            if &code != expected {
                return failed(Error::Protocol("confirmation code refused".into()));
            }
        }

        if !callbacks.on_confirm(&offer.profile).await {
            return failed(Error::Cancelled);
        }
        if cancel.is_cancelled() {
            return failed(Error::Cancelled);
        }

        callbacks.on_progress(DownloadStage::Install).await;
        let mut state = self.card.state();
        if state.profiles.iter().any(|p| p.iccid == offer.profile.iccid) {
            return failed(Error::Protocol(format!(
                "profile {} already installed",
                offer.profile.iccid
            )));
        }
        let mut profile = offer.profile.clone();
        profile.state = ProfileState::Disabled;
        let iccid = profile.iccid.clone();
        state.profiles.push(profile);
        let smdp = activation.smdp.host_str().unwrap_or(SIMULATED_SMDP).to_string();
        let sequence =
            SimulatedEuicc::record(&mut state, &iccid, NotificationOperation::Install, &smdp);
        let notification = state.notifications.last().cloned();
        let outcome = match state.install_failure.take() {
            Some(message) => Err(Error::Protocol(message)),
            None => Ok(()),
        };
        tracing::debug!(iccid = %iccid, sequence, "simulated profile installed");
        DownloadResult {
            notification,
            outcome,
        }
    }

    async fn close(&self) -> Result<()> {
        self.channel.close().await
    }
}

// ── Engine ──────────────────────────────────────────────────────────

#[derive(Default)]
struct EngineState {
    /// Card and the AID it answers on, keyed by port.
    cards: HashMap<String, (SimulatedEuicc, Vec<u8>)>,
    /// `(port, aid)` of every connect attempt.
    attempts: Vec<(String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct SimulatedEngine {
    state: Arc<Mutex<EngineState>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `card` behind `port`, answering only on `aid`.
    pub fn insert_card(&self, port: &str, aid: &[u8], card: SimulatedEuicc) {
        lock(&self.state)
            .cards
            .insert(port.to_string(), (card, aid.to_vec()));
    }

    pub fn attempts(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).attempts.clone()
    }
}

#[async_trait]
impl ProfileEngine for SimulatedEngine {
    async fn connect(
        &self,
        channel: Arc<dyn SecureElementChannel>,
        options: &ClientOptions,
    ) -> Result<Box<dyn ProfileClient>> {
        let card = {
            let mut state = lock(&self.state);
            state
                .attempts
                .push((channel.port().to_string(), options.aid.clone()));
            match state.cards.get(channel.port()) {
                Some((card, aid)) if aid == &options.aid => card.clone(),
                _ => {
                    return Err(Error::Protocol(format!(
                        "select {}: 6A82 file not found",
                        hex::encode_upper(&options.aid)
                    )))
                }
            }
        };
        Ok(Box::new(SimulatedClient { card, channel }))
    }
}

/// A disabled profile with stock operator metadata.
pub fn sample_profile(iccid: &str, name: &str) -> Result<ProfileInfo> {
    Ok(ProfileInfo {
        iccid: iccid
            .parse()
            .map_err(|e: simdeck_common::models::InvalidIccid| Error::InvalidInput(e.to_string()))?,
        state: ProfileState::Disabled,
        nickname: None,
        service_provider_name: format!("{name} Mobile"),
        profile_name: name.to_string(),
        icon: Some(ProfileIcon {
            mime: "image/png".into(),
            data: vec![0x89, b'P', b'N', b'G'],
        }),
        owner_mcc: "234".into(),
        owner_mnc: "15".into(),
    })
}
