//! LPA sessions: one exclusive, AID-negotiated protocol client per modem.
//!
//! [`SessionFactory::open`] holds the modem's key in a [`KeyMutex`] for as
//! long as the returned [`LpaSession`] lives, so two sessions never talk to
//! the same eUICC at once.

pub mod aid;
pub mod client;
pub mod driver;
mod notification;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use simdeck_common::models::{Device, Iccid, SequenceNumber};

use crate::error::{Error, Result};
use crate::keymutex::{KeyGuard, KeyMutex};

use aid::{AidCandidate, AidTrial, CANDIDATES};
use client::{
    ActivationCode, ClientOptions, DownloadCallbacks, EuiccInfo, EventEntry, NotificationMetadata,
    ProfileClient, ProfileEngine, ProfileInfo, ADMIN_PROTOCOL_VERSION,
};
use driver::{plan_channel, ChannelDriver};

pub use notification::high_water_mark;

/// Segment size used when `slowdown` is configured.
pub const SLOW_MSS: usize = 120;
pub const DEFAULT_MSS: usize = 250;

/// Discovery servers asked for pending downloads, in order.
pub const SMDS_ADDRESSES: &[&str] = &["lpa.ds.gsma.com", "lpa.live.esimdiscovery.com"];

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Always use the AT channel, even on QMI/MBIM modems.
    pub force_at: bool,
    /// Use small APDU segments for modems that choke on large ones.
    pub slowdown: bool,
}

#[derive(Clone)]
pub struct SessionFactory {
    driver: Arc<dyn ChannelDriver>,
    engine: Arc<dyn ProfileEngine>,
    locks: KeyMutex<String>,
    options: SessionOptions,
    candidates: &'static [AidCandidate],
}

impl SessionFactory {
    pub fn new(
        driver: Arc<dyn ChannelDriver>,
        engine: Arc<dyn ProfileEngine>,
        options: SessionOptions,
    ) -> Self {
        Self {
            driver,
            engine,
            locks: KeyMutex::new(),
            options,
            candidates: CANDIDATES,
        }
    }

    /// Restrict AID trial to `candidates`.
    pub fn with_candidates(mut self, candidates: &'static [AidCandidate]) -> Self {
        self.candidates = candidates;
        self
    }

    /// Whether a session for `identity` is currently open.
    pub fn is_busy(&self, identity: &str) -> bool {
        self.locks.is_locked(&identity.to_string())
    }

    /// Open a session on `device`, waiting for any session already open on it
    /// to close first.
    ///
    /// `mss` overrides the segment size picked from the factory options.
    pub async fn open(&self, device: &Device, mss: Option<usize>) -> Result<LpaSession> {
        let identity = device.equipment_identifier.clone();
        let guard = self.locks.lock_scoped(identity.clone()).await;

        let plan = plan_channel(device, self.options.force_at)?;
        let channel = plan.open(self.driver.as_ref()).await.map_err(|e| match e {
            Error::Channel(_) => e,
            other => Error::Channel(other.to_string()),
        })?;

        let mss = mss.unwrap_or(if self.options.slowdown {
            SLOW_MSS
        } else {
            DEFAULT_MSS
        });
        let mut trial = AidTrial::new(self.candidates);
        while let Some(candidate) = trial.next_candidate() {
            let options = ClientOptions {
                aid: candidate.aid.to_vec(),
                mss,
                admin_protocol_version: ADMIN_PROTOCOL_VERSION.to_string(),
            };
            match self.engine.connect(channel.clone(), &options).await {
                Ok(client) => {
                    tracing::info!(modem = %identity, aid = %candidate, mss, "LPA client created");
                    return Ok(LpaSession {
                        identity,
                        aid: candidate,
                        client: Some(client),
                        guard: Some(guard),
                    });
                }
                Err(e) => trial.reject(candidate, e),
            }
        }

        tracing::info!(modem = %identity, tried = trial.rejected(), "no ISD-R AID answered");
        if let Err(e) = channel.close().await {
            tracing::warn!(modem = %identity, error = %e, "failed to close channel");
        }
        Err(Error::NoSupportedSecureElement)
    }
}

/// An open protocol client on one modem.
///
/// Call [`close`](Self::close) when done. Dropping an open session closes it
/// in the background and only then releases the modem.
pub struct LpaSession {
    identity: String,
    aid: AidCandidate,
    client: Option<Box<dyn ProfileClient>>,
    guard: Option<KeyGuard<String>>,
}

impl LpaSession {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn aid(&self) -> AidCandidate {
        self.aid
    }

    fn client(&self) -> Result<&dyn ProfileClient> {
        self.client
            .as_deref()
            .ok_or_else(|| Error::Channel("session already closed".into()))
    }

    /// Close the client and channel, then release the modem.
    pub async fn close(mut self) -> Result<()> {
        let result = match self.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        };
        drop(self.guard.take());
        tracing::debug!(modem = %self.identity, "LPA session closed");
        result
    }

    pub async fn list_profiles(&mut self) -> Result<Vec<ProfileInfo>> {
        self.client()?.list_profile().await
    }

    pub async fn enable_profile(&mut self, iccid: &Iccid) -> Result<()> {
        self.client()?.enable_profile(iccid, true).await
    }

    pub async fn set_nickname(&mut self, iccid: &Iccid, nickname: &str) -> Result<()> {
        self.client()?.set_nickname(iccid, nickname).await
    }

    pub async fn list_notifications(&mut self) -> Result<Vec<NotificationMetadata>> {
        self.client()?.list_notification(None).await
    }

    pub async fn remove_notification(&mut self, sequence: SequenceNumber) -> Result<()> {
        self.client()?.remove_notification_from_list(sequence).await
    }

    pub async fn euicc_info(&mut self) -> Result<EuiccInfo> {
        self.client()?.euicc_info().await
    }

    /// Events registered for this eUICC on every known SM-DS. Any failing
    /// server fails the whole lookup.
    pub async fn discover(&mut self, imei: &str) -> Result<Vec<EventEntry>> {
        let mut entries = Vec::new();
        for host in SMDS_ADDRESSES {
            let smds = url::Url::parse(&format!("https://{host}"))
                .map_err(|e| Error::Protocol(format!("SM-DS address {host}: {e}")))?;
            tracing::info!(modem = %self.identity, smds = %host, "discovering profiles");
            entries.extend(self.client()?.discover(&smds, imei).await?);
        }
        Ok(entries)
    }

    /// Download a profile and deliver the install notification it produces.
    ///
    /// A notification failure is reported together with the download's own
    /// error, if any.
    pub async fn download(
        &mut self,
        cancel: CancellationToken,
        activation: &ActivationCode,
        callbacks: &dyn DownloadCallbacks,
    ) -> Result<()> {
        tracing::info!(
            modem = %self.identity,
            smdp = %activation.smdp,
            matching_id = %activation.matching_id,
            "downloading profile"
        );
        let result = self.client()?.download(cancel, activation, callbacks).await;

        let notification_error = match result.notification {
            Some(ref n) if n.sequence_number > 0 => {
                tracing::info!(modem = %self.identity, sequence = n.sequence_number, "sending install notification");
                self.deliver(n.sequence_number).await.err()
            }
            _ => None,
        };

        match (result.outcome, notification_error) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(e)) => Err(e),
            (Err(e), None) => Err(e),
            (Err(download), Some(notification)) => Err(Error::Protocol(format!(
                "{download}; notification: {notification}"
            ))),
        }
    }
}

impl Drop for LpaSession {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        tracing::warn!(modem = %self.identity, "LPA session dropped without close");
        let guard = self.guard.take();
        let identity = self.identity.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.close().await {
                        tracing::warn!(modem = %identity, error = %e, "failed to close LPA client");
                    }
                    drop(guard);
                });
            }
            Err(_) => drop(guard),
        }
    }
}
