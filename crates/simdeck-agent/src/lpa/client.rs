//! Profile protocol engine seam.
//!
//! The SGP.22 engine (ES10x over APDUs, ES9+ to the SM-DP+) lives behind
//! [`ProfileEngine`] / [`ProfileClient`]; this crate only orchestrates it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use url::Url;

use simdeck_common::models::{Iccid, NotificationOperation, ProfileState, SequenceNumber};
use simdeck_common::protocol::ProfilePreview;

use super::driver::SecureElementChannel;
use crate::error::Result;

pub const ADMIN_PROTOCOL_VERSION: &str = "2.2.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// ISD-R application identifier to select.
    pub aid: Vec<u8>,
    /// Maximum APDU segment size.
    pub mss: usize,
    pub admin_protocol_version: String,
}

/// Entry of the eUICC's pending notification list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMetadata {
    pub sequence_number: SequenceNumber,
    pub iccid: Iccid,
    /// SM-DP+ address the notification is destined for.
    pub smdp: String,
    pub operation: NotificationOperation,
}

/// A signed notification ready to be delivered to its SM-DP+.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub sequence_number: SequenceNumber,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileIcon {
    /// MIME type, e.g. `image/png`.
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileInfo {
    pub iccid: Iccid,
    pub state: ProfileState,
    pub nickname: Option<String>,
    pub service_provider_name: String,
    pub profile_name: String,
    pub icon: Option<ProfileIcon>,
    pub owner_mcc: String,
    pub owner_mnc: String,
}

impl ProfileInfo {
    /// Nickname if set, otherwise the operator-provided name.
    pub fn display_name(&self) -> &str {
        match self.nickname.as_deref() {
            Some(nickname) if !nickname.is_empty() => nickname,
            _ => &self.profile_name,
        }
    }

    pub fn icon_data_uri(&self) -> Option<String> {
        self.icon
            .as_ref()
            .map(|icon| format!("data:{};base64,{}", icon.mime, STANDARD.encode(&icon.data)))
    }

    pub fn preview(&self) -> ProfilePreview {
        ProfilePreview {
            iccid: self.iccid.to_string(),
            service_provider_name: self.service_provider_name.clone(),
            profile_name: self.profile_name.clone(),
            profile_nickname: self.nickname.clone().filter(|n| !n.is_empty()),
            profile_state: self.state.to_string(),
            icon: self.icon_data_uri(),
            icon_type: self.icon.as_ref().map(|icon| icon.mime.clone()),
            owner_mcc: self.owner_mcc.clone(),
            owner_mnc: self.owner_mnc.clone(),
        }
    }
}

/// A pending download an SM-DS announced for this eUICC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub event_id: String,
    /// SM-DP+ that holds the profile.
    pub rsp_server_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EuiccInfo {
    pub eid: String,
    pub free_space: i32,
    pub sas_accreditation_number: String,
    pub certificates: Vec<String>,
}

/// Parsed activation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationCode {
    /// Always `https://host[:port]`.
    pub smdp: Url,
    pub matching_id: String,
    pub imei: String,
    pub confirmation_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStage {
    AuthenticateClient,
    AuthenticateServer,
    Install,
}

impl fmt::Display for DownloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStage::AuthenticateClient => write!(f, "Authenticating Client"),
            DownloadStage::AuthenticateServer => write!(f, "Authenticating Server"),
            DownloadStage::Install => write!(f, "Installing"),
        }
    }
}

/// What the engine hands back from a download, successful or not.
#[derive(Debug)]
pub struct DownloadResult {
    /// Install notification produced by the eUICC, if it got that far.
    pub notification: Option<NotificationMetadata>,
    pub outcome: Result<()>,
}

/// Hooks the engine calls while a download is in flight.
#[async_trait]
pub trait DownloadCallbacks: Send + Sync {
    async fn on_progress(&self, stage: DownloadStage);

    /// Show the profile to the user; `true` continues the download.
    async fn on_confirm(&self, profile: &ProfileInfo) -> bool;

    /// Ask for the operator's confirmation code. An empty string aborts.
    async fn on_enter_confirmation_code(&self) -> String;
}

/// One connected protocol client, bound to an open channel.
#[async_trait]
pub trait ProfileClient: Send + Sync {
    /// Notification list, optionally filtered to one operation.
    async fn list_notification(
        &self,
        filter: Option<NotificationOperation>,
    ) -> Result<Vec<NotificationMetadata>>;

    async fn retrieve_notification_list(
        &self,
        sequence: SequenceNumber,
    ) -> Result<Vec<PendingNotification>>;

    async fn handle_notification(&self, notification: &PendingNotification) -> Result<()>;

    async fn remove_notification_from_list(&self, sequence: SequenceNumber) -> Result<()>;

    async fn list_profile(&self) -> Result<Vec<ProfileInfo>>;

    async fn enable_profile(&self, iccid: &Iccid, refresh: bool) -> Result<()>;

    async fn delete_profile(&self, iccid: &Iccid) -> Result<()>;

    async fn set_nickname(&self, iccid: &Iccid, nickname: &str) -> Result<()>;

    async fn euicc_info(&self) -> Result<EuiccInfo>;

    /// Ask the SM-DS at `smds` for events registered to this eUICC.
    async fn discover(&self, smds: &Url, imei: &str) -> Result<Vec<EventEntry>>;

    async fn download(
        &self,
        cancel: CancellationToken,
        activation: &ActivationCode,
        callbacks: &dyn DownloadCallbacks,
    ) -> DownloadResult;

    /// Close the client and the channel beneath it.
    async fn close(&self) -> Result<()>;
}

/// Connects protocol clients over an open channel.
#[async_trait]
pub trait ProfileEngine: Send + Sync {
    /// Select `options.aid` on the channel and return a client, or fail if
    /// the card does not answer to that AID.
    async fn connect(
        &self,
        channel: Arc<dyn SecureElementChannel>,
        options: &ClientOptions,
    ) -> Result<Box<dyn ProfileClient>>;
}
