//! Provisioning service.
//!
//! Every eUICC operation follows the same shape: find the modem, open an
//! exclusive session, run, close. Operations that switch the active profile
//! or SIM slot additionally restart the modem, wait for it to re-enumerate
//! and then deliver whatever notifications the switch produced.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use simdeck_common::models::{
    Device, DiscoveredProfile, EuiccSummary, Iccid, NotificationSummary, ProfileSummary,
    SequenceNumber,
};

use crate::config::SettingsStore;
use crate::error::{Error, Result};
use crate::lpa::client::{ActivationCode, DownloadCallbacks, ProfileInfo};
use crate::lpa::{LpaSession, SessionFactory};
use crate::modem::registry::Registry;

pub const NICKNAME_MAX_BYTES: usize = 64;

/// Upper bound for one profile download, user interaction included.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct ProvisioningService {
    registry: Registry,
    sessions: Option<SessionFactory>,
    settings: SettingsStore,
    restart_timeout: Duration,
    download_timeout: Duration,
}

impl ProvisioningService {
    /// `sessions` is `None` when no profile engine is available; inventory
    /// still works, eUICC operations fail with [`Error::EngineUnavailable`].
    pub fn new(
        registry: Registry,
        sessions: Option<SessionFactory>,
        settings: SettingsStore,
        restart_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sessions,
            settings,
            restart_timeout,
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    /// Override [`DOWNLOAD_TIMEOUT`].
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    // ── Inventory ───────────────────────────────────────────────

    /// Every managed modem, ordered by identity.
    pub async fn modems(&self) -> Result<Vec<Device>> {
        let snapshot = self.registry.modems().await?;
        let mut modems: Vec<Device> = snapshot.values().cloned().collect();
        modems.sort_by(|a, b| a.equipment_identifier.cmp(&b.equipment_identifier));
        Ok(modems)
    }

    pub async fn modem(&self, identity: &str) -> Result<Device> {
        self.registry.find(identity).await
    }

    async fn open(&self, device: &Device) -> Result<LpaSession> {
        let sessions = self.sessions.as_ref().ok_or(Error::EngineUnavailable)?;
        let mss = self.settings.get(&device.equipment_identifier).mss;
        sessions.open(device, mss).await
    }

    /// Whether the modem's SIM answers on any known ISD-R AID.
    pub async fn supports_esim(&self, device: &Device) -> Result<bool> {
        match self.open(device).await {
            Ok(session) => {
                finish(session, Ok(())).await?;
                Ok(true)
            }
            Err(Error::NoSupportedSecureElement) => Ok(false),
            Err(e) => Err(e.on_device(&device.equipment_identifier)),
        }
    }

    // ── Profiles ────────────────────────────────────────────────

    pub async fn list_profiles(&self, identity: &str) -> Result<Vec<ProfileSummary>> {
        let device = self.modem(identity).await?;
        let profiles = async {
            let mut session = self.open(&device).await?;
            let result = session.list_profiles().await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))?;
        Ok(profiles.iter().map(profile_summary).collect())
    }

    /// Enable `iccid`, restart the modem and deliver the notifications the
    /// switch produced once it is back.
    ///
    /// Notification delivery failures are logged; the profile is enabled
    /// either way.
    pub async fn enable_profile(&self, identity: &str, iccid: &Iccid) -> Result<()> {
        let device = self.modem(identity).await?;
        self.switch_profile(&device, iccid)
            .await
            .map_err(|e| e.on_device(identity))
    }

    async fn switch_profile(&self, device: &Device, iccid: &Iccid) -> Result<()> {
        let identity = device.equipment_identifier.as_str();

        let mut session = self.open(device).await?;
        let enabled: Result<SequenceNumber> = async {
            let mark = session.high_water_mark().await?;
            session.enable_profile(iccid).await?;
            Ok(mark)
        }
        .await;
        let mark = finish(session, enabled).await?;
        tracing::info!(modem = %identity, %iccid, mark, "profile enabled, restarting modem");

        let returned = self
            .restart_and_wait(device, |registry, device| {
                let compatible = self.settings.get(identity).compatible;
                async move { registry.restart(&device, compatible).await }
            })
            .await?;

        match self.replay(&returned, mark).await {
            Ok(sent) if !sent.is_empty() => {
                tracing::info!(modem = %identity, count = sent.len(), "pending notifications sent")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(modem = %identity, error = %e, "failed to handle modem notifications"),
        }
        Ok(())
    }

    async fn replay(&self, device: &Device, mark: SequenceNumber) -> Result<Vec<SequenceNumber>> {
        let mut session = self.open(device).await?;
        let result = session.replay_after(mark).await;
        finish(session, result).await
    }

    /// Arm a watch, run `trigger`, then wait for the modem to come back.
    async fn restart_and_wait<F, Fut>(&self, device: &Device, trigger: F) -> Result<Device>
    where
        F: FnOnce(Registry, Device) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let watch = self.registry.watch_device(&device.equipment_identifier).await?;
        trigger(self.registry.clone(), device.clone()).await?;
        let returned = watch.wait(self.restart_timeout).await?;
        tracing::info!(
            modem = %returned.equipment_identifier,
            path = %returned.path,
            "modem is back"
        );
        Ok(returned)
    }

    /// Delete `iccid` and deliver the resulting delete notification.
    ///
    /// Returns the notification sequence numbers that were sent.
    pub async fn delete_profile(&self, identity: &str, iccid: &Iccid) -> Result<Vec<SequenceNumber>> {
        let device = self.modem(identity).await?;
        async {
            let mut session = self.open(&device).await?;
            let result = session.delete_profile(iccid).await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))
    }

    pub async fn set_nickname(&self, identity: &str, iccid: &Iccid, nickname: &str) -> Result<()> {
        validate_nickname(nickname)?;
        let device = self.modem(identity).await?;
        async {
            let mut session = self.open(&device).await?;
            let result = session.set_nickname(iccid, nickname).await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))
    }

    /// Pending downloads the discovery servers hold for the modem's eUICC.
    pub async fn discover(&self, identity: &str) -> Result<Vec<DiscoveredProfile>> {
        let device = self.modem(identity).await?;
        let entries = async {
            let mut session = self.open(&device).await?;
            let result = session.discover(identity).await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))?;
        Ok(entries
            .into_iter()
            .map(|entry| DiscoveredProfile {
                event_id: entry.event_id,
                address: entry.rsp_server_address,
            })
            .collect())
    }

    /// Download a profile onto `device`.
    ///
    /// Waiting for the modem and the download itself both end with
    /// [`Error::Cancelled`] once `cancel` fires, and with
    /// [`Error::DeadlineExceeded`] after the download timeout.
    pub async fn download_profile(
        &self,
        device: &Device,
        activation: &ActivationCode,
        cancel: CancellationToken,
        callbacks: &dyn DownloadCallbacks,
    ) -> Result<()> {
        let run = self.download_on(device, activation, &cancel, callbacks);
        let result = match tokio::time::timeout(self.download_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    modem = %device.equipment_identifier,
                    timeout = ?self.download_timeout,
                    "download timed out"
                );
                Err(Error::DeadlineExceeded)
            }
        };
        result.map_err(|e| e.on_device(&device.equipment_identifier))
    }

    async fn download_on(
        &self,
        device: &Device,
        activation: &ActivationCode,
        cancel: &CancellationToken,
        callbacks: &dyn DownloadCallbacks,
    ) -> Result<()> {
        // The modem may be busy with another session; stop waiting for it
        // once the user gives up.
        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            session = self.open(device) => session?,
        };
        let result = session.download(cancel.clone(), activation, callbacks).await;
        finish(session, result).await
    }

    // ── Notifications ───────────────────────────────────────────

    pub async fn list_notifications(&self, identity: &str) -> Result<Vec<NotificationSummary>> {
        let device = self.modem(identity).await?;
        let notifications = async {
            let mut session = self.open(&device).await?;
            let result = session.list_notifications().await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))?;
        Ok(notifications
            .into_iter()
            .map(|n| NotificationSummary {
                sequence_number: n.sequence_number.to_string(),
                iccid: n.iccid.to_string(),
                smdp: n.smdp,
                operation: n.operation,
            })
            .collect())
    }

    pub async fn resend_notification(&self, identity: &str, sequence: SequenceNumber) -> Result<()> {
        let device = self.modem(identity).await?;
        async {
            let mut session = self.open(&device).await?;
            let result = session.resend_notification(sequence).await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))
    }

    pub async fn remove_notification(&self, identity: &str, sequence: SequenceNumber) -> Result<()> {
        let device = self.modem(identity).await?;
        async {
            let mut session = self.open(&device).await?;
            let result = session.remove_notification(sequence).await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))
    }

    // ── eUICC / SIM ─────────────────────────────────────────────

    pub async fn euicc_info(&self, identity: &str) -> Result<EuiccSummary> {
        let device = self.modem(identity).await?;
        let info = async {
            let mut session = self.open(&device).await?;
            let result = session.euicc_info().await;
            finish(session, result).await
        }
        .await
        .map_err(|e| e.on_device(identity))?;
        Ok(EuiccSummary {
            eid: info.eid,
            free_space: info.free_space,
            sas_accreditation_number: info.sas_accreditation_number,
            certificates: info.certificates,
        })
    }

    /// Make the slot holding SIM `identifier` primary and wait for the modem
    /// to come back with it.
    pub async fn switch_sim_slot(&self, identity: &str, identifier: &str) -> Result<Device> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::InvalidInput("identifier is required".into()));
        }
        let device = self.modem(identity).await?;
        let slot = self.find_sim_slot(&device, identifier).await?;
        tracing::info!(modem = %identity, slot, identifier, "switching SIM slot");

        self.restart_and_wait(&device, move |registry, device| async move {
            registry.set_primary_sim_slot(&device, slot).await
        })
        .await
        .map_err(|e| e.on_device(identity))
    }

    /// 1-based index of the inactive slot holding `identifier`.
    async fn find_sim_slot(&self, device: &Device, identifier: &str) -> Result<u32> {
        if device.sim_slots.is_empty() {
            return Err(Error::InvalidInput("sim slots not available".into()));
        }
        for (index, path) in device.sim_slots.iter().enumerate() {
            let sim = self
                .registry
                .sim(path)
                .await
                .map_err(|e| e.on_device(&device.equipment_identifier))?;
            if sim.identifier == identifier && !sim.active {
                return Ok(index as u32 + 1);
            }
        }
        Err(Error::InvalidInput(format!("sim slot {identifier:?} not found")))
    }
}

/// Close `session`, keeping the operation's result. A close failure is only
/// reported when the operation itself succeeded.
async fn finish<T>(session: LpaSession, result: Result<T>) -> Result<T> {
    let identity = session.identity().to_string();
    match (result, session.close().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            tracing::warn!(modem = %identity, error = %close, "failed to close LPA client");
            Err(e)
        }
    }
}

pub fn validate_nickname(nickname: &str) -> Result<()> {
    if nickname.len() > NICKNAME_MAX_BYTES {
        return Err(Error::InvalidInput(
            "nickname must be valid utf-8 and 64 bytes or fewer".into(),
        ));
    }
    Ok(())
}

fn profile_summary(profile: &ProfileInfo) -> ProfileSummary {
    ProfileSummary {
        name: profile.display_name().to_string(),
        service_provider_name: profile.service_provider_name.clone(),
        iccid: profile.iccid.to_string(),
        icon: profile.icon_data_uri().unwrap_or_default(),
        profile_state: profile.state.as_raw(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use simdeck_common::models::{NotificationOperation, ProfileState};

    use super::*;
    use crate::config::{ModemSettingsUpdate, DEFAULT_RESTART_TIMEOUT};
    use crate::lpa::aid::CANDIDATES;
    use crate::lpa::SessionOptions;
    use crate::lpa::client::DownloadStage;
    use crate::simulate::{
        iccid_for, modem_properties, sample_profile, BusCall, Offer, SimulatedBus,
        SimulatedDriver, SimulatedEngine, SimulatedEuicc,
    };

    const IMEI: &str = "860000000000001";
    const SMDP: &str = "rsp.example.com";

    struct Fixture {
        service: ProvisioningService,
        bus: SimulatedBus,
        driver: SimulatedDriver,
        card: SimulatedEuicc,
        path: String,
    }

    fn fixture(port_type: u32, restart_timeout: Duration) -> Fixture {
        let bus = SimulatedBus::new();
        bus.set_reenumerate_delay(Duration::from_millis(10));
        let driver = SimulatedDriver::new();
        let engine = SimulatedEngine::new();
        let card = SimulatedEuicc::new("89049032000000000000000000000001");
        let port = if port_type == 3 { "ttyUSB2" } else { "cdc-wdm0" };
        let path = bus.plug(modem_properties(IMEI, port, port_type));
        engine.insert_card(&format!("/dev/{port}"), CANDIDATES[0].aid, card.clone());

        let sessions = SessionFactory::new(
            Arc::new(driver.clone()),
            Arc::new(engine),
            SessionOptions::default(),
        );
        let service = ProvisioningService::new(
            Registry::new(Arc::new(bus.clone())),
            Some(sessions),
            SettingsStore::default(),
            restart_timeout,
        );
        Fixture {
            service,
            bus,
            driver,
            card,
            path,
        }
    }

    fn iccid(index: u32) -> Iccid {
        iccid_for(IMEI, index).parse().unwrap()
    }

    /// A user who never answers.
    struct Silent;

    #[async_trait::async_trait]
    impl DownloadCallbacks for Silent {
        async fn on_progress(&self, _stage: DownloadStage) {}

        async fn on_confirm(&self, _profile: &ProfileInfo) -> bool {
            std::future::pending().await
        }

        async fn on_enter_confirmation_code(&self) -> String {
            std::future::pending().await
        }
    }

    fn offer(card: &SimulatedEuicc, matching_id: &str) -> ActivationCode {
        card.add_offer(
            matching_id,
            Offer {
                profile: sample_profile(iccid(3).as_str(), "Roaming").unwrap(),
                confirmation_code: None,
            },
        );
        ActivationCode {
            smdp: url::Url::parse(&format!("https://{SMDP}")).unwrap(),
            matching_id: matching_id.into(),
            imei: IMEI.into(),
            confirmation_code: None,
        }
    }

    fn seed_profiles(card: &SimulatedEuicc) {
        let mut home = sample_profile(iccid(1).as_str(), "Home").unwrap();
        home.state = ProfileState::Enabled;
        card.add_profile(home);
        card.add_profile(sample_profile(iccid(2).as_str(), "Travel").unwrap());
    }

    #[tokio::test]
    async fn list_profiles_summarizes() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        seed_profiles(&f.card);

        let profiles = f.service.list_profiles(IMEI).await.unwrap();
        assert_eq!(profiles.len(), 2);
        let home = profiles.iter().find(|p| p.name == "Home").unwrap();
        assert_eq!(home.profile_state, 1);
        assert!(home.icon.starts_with("data:image/png;base64,"));
        assert_eq!(f.driver.live_channels("/dev/cdc-wdm0"), 0);
    }

    #[tokio::test]
    async fn unknown_modem_is_not_found() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        let err = f.service.list_profiles("000").await.unwrap_err();
        assert!(matches!(err, Error::ModemNotFound(_)));
    }

    #[tokio::test]
    async fn enable_restarts_and_replays_notifications() {
        let f = fixture(7, Duration::from_secs(2));
        seed_profiles(&f.card);
        let old = f
            .card
            .push_notification(&iccid(1), NotificationOperation::Install, SMDP);

        f.service.enable_profile(IMEI, &iccid(2)).await.unwrap();

        // Disable of Home and enable of Travel were sent and removed.
        let handled = f.card.handled();
        assert_eq!(handled.len(), 2);
        assert!(handled.iter().all(|&seq| seq > old));
        let left: Vec<_> = f.card.notifications().iter().map(|n| n.sequence_number).collect();
        assert_eq!(left, vec![old]);

        let calls = f.bus.calls();
        assert!(calls.contains(&BusCall::Enable(f.path.clone(), false)));
        assert!(calls.contains(&BusCall::Enable(f.path.clone(), true)));
        assert!(!calls.iter().any(|c| matches!(c, BusCall::Inhibit(..))));
        assert_ne!(f.bus.path_of(IMEI).unwrap(), f.path);
        assert_eq!(f.driver.live_channels("/dev/cdc-wdm0"), 0);
    }

    #[tokio::test]
    async fn compatible_modem_is_inhibited_and_qmi_power_cycled() {
        let f = fixture(6, Duration::from_secs(2));
        seed_profiles(&f.card);
        f.service
            .settings()
            .update(
                IMEI,
                ModemSettingsUpdate {
                    compatible: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        f.service.enable_profile(IMEI, &iccid(2)).await.unwrap();

        let calls = f.bus.calls();
        let uid = modem_properties(IMEI, "cdc-wdm0", 6).device;
        assert!(matches!(calls.first(), Some(BusCall::PowerCycleSim(port, 1)) if port == "/dev/cdc-wdm0"));
        assert!(calls.contains(&BusCall::Inhibit(uid.clone(), true)));
        assert!(calls.contains(&BusCall::Inhibit(uid, false)));
    }

    #[tokio::test]
    async fn enable_times_out_when_modem_stays_away() {
        let f = fixture(7, Duration::from_millis(100));
        seed_profiles(&f.card);
        f.bus.set_reenumerate_delay(Duration::from_secs(5));

        let err = f.service.enable_profile(IMEI, &iccid(2)).await.unwrap_err();
        assert!(matches!(err.root(), Error::DeadlineExceeded), "{err}");
        // The switch itself happened before the restart.
        let travel = f.card.profiles().into_iter().find(|p| p.iccid == iccid(2)).unwrap();
        assert_eq!(travel.state, ProfileState::Enabled);
    }

    #[tokio::test]
    async fn delete_returns_sent_notifications() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        seed_profiles(&f.card);

        let sent = f.service.delete_profile(IMEI, &iccid(2)).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(f.card.handled(), sent);
    }

    #[tokio::test]
    async fn long_nickname_is_rejected_without_touching_the_card() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        seed_profiles(&f.card);
        let nickname = "x".repeat(NICKNAME_MAX_BYTES + 1);

        let err = f
            .service
            .set_nickname(IMEI, &iccid(1), &nickname)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(f.driver.opened().is_empty());

        // Multi-byte characters count by bytes.
        assert!(validate_nickname(&"é".repeat(32)).is_ok());
        assert!(validate_nickname(&"é".repeat(33)).is_err());
    }

    #[tokio::test]
    async fn nickname_is_stored() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        seed_profiles(&f.card);
        f.service.set_nickname(IMEI, &iccid(2), "Abroad").await.unwrap();

        let profiles = f.service.list_profiles(IMEI).await.unwrap();
        assert!(profiles.iter().any(|p| p.name == "Abroad"));
    }

    #[tokio::test]
    async fn notifications_are_listed_with_string_sequences() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        f.card
            .push_notification(&iccid(1), NotificationOperation::Install, SMDP);

        let listed = f.service.list_notifications(IMEI).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sequence_number, "1");
        assert_eq!(listed[0].operation, NotificationOperation::Install);

        f.service.resend_notification(IMEI, 1).await.unwrap();
        assert_eq!(f.card.handled(), vec![1]);
        f.service.remove_notification(IMEI, 1).await.unwrap();
        assert!(f.card.notifications().is_empty());
    }

    #[tokio::test]
    async fn supports_esim_is_false_without_isd_r() {
        let f = fixture(3, DEFAULT_RESTART_TIMEOUT);
        let device = f.service.modem(IMEI).await.unwrap();
        assert!(f.service.supports_esim(&device).await.unwrap());

        let other = SimulatedBus::new();
        other.plug(modem_properties("860000000000009", "ttyUSB0", 3));
        let service = ProvisioningService::new(
            Registry::new(Arc::new(other)),
            Some(SessionFactory::new(
                Arc::new(SimulatedDriver::new()),
                Arc::new(SimulatedEngine::new()),
                SessionOptions::default(),
            )),
            SettingsStore::default(),
            DEFAULT_RESTART_TIMEOUT,
        );
        let device = service.modem("860000000000009").await.unwrap();
        assert!(!service.supports_esim(&device).await.unwrap());
    }

    #[tokio::test]
    async fn missing_engine_is_reported() {
        let bus = SimulatedBus::new();
        bus.plug(modem_properties(IMEI, "cdc-wdm0", 7));
        let service = ProvisioningService::new(
            Registry::new(Arc::new(bus)),
            None,
            SettingsStore::default(),
            DEFAULT_RESTART_TIMEOUT,
        );
        assert_eq!(service.modems().await.unwrap().len(), 1);
        let err = service.euicc_info(IMEI).await.unwrap_err();
        assert!(matches!(err.root(), Error::EngineUnavailable));
    }

    #[tokio::test]
    async fn switch_sim_slot_waits_for_modem() {
        let f = fixture(7, Duration::from_secs(2));
        f.bus.add_sim_slot(&f.path, "8944990000000000001").unwrap();

        let device = f
            .service
            .switch_sim_slot(IMEI, "8944990000000000001")
            .await
            .unwrap();
        assert_eq!(device.primary_sim_slot, 2);
        assert!(f
            .bus
            .calls()
            .contains(&BusCall::SetPrimarySimSlot(f.path.clone(), 2)));
    }

    #[tokio::test]
    async fn switch_sim_slot_rejects_active_and_unknown() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        let active = iccid_for(IMEI, 0);

        for identifier in [active.as_str(), "8944990000000000001", "  "] {
            let err = f.service.switch_sim_slot(IMEI, identifier).await.unwrap_err();
            assert!(matches!(err.root(), Error::InvalidInput(_)), "{identifier}: {err}");
        }
        assert!(f.bus.calls().is_empty());
    }

    #[tokio::test]
    async fn download_timeout_is_a_deadline_not_a_cancel() {
        let mut f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        f.service = f.service.with_download_timeout(Duration::from_millis(100));
        let activation = offer(&f.card, "MATCH");
        let device = f.service.modem(IMEI).await.unwrap();
        let cancel = CancellationToken::new();

        let err = f
            .service
            .download_profile(&device, &activation, cancel.clone(), &Silent)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::DeadlineExceeded), "{err}");
        assert!(cancel.is_cancelled());

        // The abandoned session still hands the modem back.
        let profiles = tokio::time::timeout(Duration::from_secs(1), f.service.list_profiles(IMEI))
            .await
            .unwrap()
            .unwrap();
        assert!(profiles.iter().all(|p| p.name != "Roaming"));
    }

    #[tokio::test]
    async fn download_waiting_for_busy_modem_stops_on_cancel() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        let activation = offer(&f.card, "MATCH");
        let device = f.service.modem(IMEI).await.unwrap();
        let held = f.service.open(&device).await.unwrap();

        let cancel = CancellationToken::new();
        let download = {
            let service = f.service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                service
                    .download_profile(&device, &activation, cancel, &Silent)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!download.is_finished());

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_millis(500), download)
            .await
            .expect("download still waiting after cancel")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err.root(), Error::Cancelled), "{err}");
        // Only the held session ever opened a channel.
        assert_eq!(f.driver.opened().len(), 1);

        finish(held, Ok(())).await.unwrap();
        assert!(f.card.profiles().is_empty());
    }

    #[tokio::test]
    async fn download_deadline_covers_waiting_for_busy_modem() {
        let mut f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        f.service = f.service.with_download_timeout(Duration::from_millis(100));
        let activation = offer(&f.card, "MATCH");
        let device = f.service.modem(IMEI).await.unwrap();
        let held = f.service.open(&device).await.unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            f.service
                .download_profile(&device, &activation, CancellationToken::new(), &Silent),
        )
        .await
        .expect("deadline did not bound the wait for the modem")
        .unwrap_err();
        assert!(matches!(err.root(), Error::DeadlineExceeded), "{err}");
        assert_eq!(f.driver.opened().len(), 1);
        finish(held, Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn discovery_collects_every_smds() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        f.card.add_event(crate::lpa::SMDS_ADDRESSES[0], "EVT-1", "rsp.one.example");
        f.card.add_event(crate::lpa::SMDS_ADDRESSES[1], "EVT-2", "rsp.two.example");

        let found = f.service.discover(IMEI).await.unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.event_id.as_str()).collect();
        assert_eq!(ids, vec!["EVT-1", "EVT-2"]);
        assert_eq!(found[1].address, "rsp.two.example");
        assert_eq!(f.driver.live_channels("/dev/cdc-wdm0"), 0);
    }

    #[tokio::test]
    async fn unreachable_smds_fails_discovery() {
        let f = fixture(7, DEFAULT_RESTART_TIMEOUT);
        f.card.add_event(crate::lpa::SMDS_ADDRESSES[0], "EVT-1", "rsp.one.example");
        f.card.fail_smds(crate::lpa::SMDS_ADDRESSES[1]);

        let err = f.service.discover(IMEI).await.unwrap_err();
        assert!(matches!(err.root(), Error::Protocol(_)), "{err}");
        assert_eq!(f.driver.live_channels("/dev/cdc-wdm0"), 0);
    }
}
