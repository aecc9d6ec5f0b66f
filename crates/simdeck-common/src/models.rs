//! Data models shared between the agent and its clients.
//!
//! Modem types mirror what ModemManager reports over D-Bus. Profile and
//! notification types are the host-side view of an eUICC's contents.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Modem ───────────────────────────────────────────────────────────

/// A modem as last reported by the device bus.
///
/// `equipment_identifier` (the IMEI) is the durable identity. `path` is the
/// bus object path and changes whenever the modem manager re-enumerates the
/// device, so it must never be used as a key across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub path: String,
    pub equipment_identifier: String,
    /// Sysfs path of the physical device (used to inhibit/uninhibit it).
    pub device: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    pub primary_port: String,
    pub ports: Vec<ModemPort>,
    pub sim_slots: Vec<String>,
    /// 1-based; 0 when the modem has a single slot.
    pub primary_sim_slot: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim: Option<Sim>,
    pub state: ModemState,
}

impl Device {
    /// Type of the port the modem manager marked as primary.
    pub fn primary_port_type(&self) -> PortType {
        self.ports
            .iter()
            .find(|port| port.device == self.primary_port)
            .map(|port| port.port_type)
            .unwrap_or(PortType::Unknown)
    }

    /// First port of the given type.
    pub fn port(&self, port_type: PortType) -> Option<&ModemPort> {
        self.ports.iter().find(|port| port.port_type == port_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemPort {
    pub port_type: PortType,
    /// Character device, e.g. `/dev/cdc-wdm0`.
    pub device: String,
}

/// `MMModemPortType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Unknown,
    Net,
    At,
    Qcdm,
    Gps,
    Qmi,
    Mbim,
    Audio,
    Ignored,
}

impl PortType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => PortType::Net,
            3 => PortType::At,
            4 => PortType::Qcdm,
            5 => PortType::Gps,
            6 => PortType::Qmi,
            7 => PortType::Mbim,
            8 => PortType::Audio,
            9 => PortType::Ignored,
            _ => PortType::Unknown,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            PortType::Unknown => 1,
            PortType::Net => 2,
            PortType::At => 3,
            PortType::Qcdm => 4,
            PortType::Gps => 5,
            PortType::Qmi => 6,
            PortType::Mbim => 7,
            PortType::Audio => 8,
            PortType::Ignored => 9,
        }
    }
}

/// `MMModemState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModemState {
    Failed,
    Unknown,
    Initializing,
    Locked,
    Disabled,
    Disabling,
    Enabling,
    Enabled,
    Searching,
    Registered,
    Disconnecting,
    Connecting,
    Connected,
}

impl ModemState {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => ModemState::Failed,
            1 => ModemState::Initializing,
            2 => ModemState::Locked,
            3 => ModemState::Disabled,
            4 => ModemState::Disabling,
            5 => ModemState::Enabling,
            6 => ModemState::Enabled,
            7 => ModemState::Searching,
            8 => ModemState::Registered,
            9 => ModemState::Disconnecting,
            10 => ModemState::Connecting,
            11 => ModemState::Connected,
            _ => ModemState::Unknown,
        }
    }
}

impl std::fmt::Display for ModemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ModemState::Failed => "failed",
            ModemState::Unknown => "unknown",
            ModemState::Initializing => "initializing",
            ModemState::Locked => "locked",
            ModemState::Disabled => "disabled",
            ModemState::Disabling => "disabling",
            ModemState::Enabling => "enabling",
            ModemState::Enabled => "enabled",
            ModemState::Searching => "searching",
            ModemState::Registered => "registered",
            ModemState::Disconnecting => "disconnecting",
            ModemState::Connecting => "connecting",
            ModemState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// A SIM card object (physical or the active eSIM profile).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sim {
    pub path: String,
    pub active: bool,
    /// ICCID.
    pub identifier: String,
    pub eid: String,
    pub imsi: String,
    pub operator_identifier: String,
    pub operator_name: String,
}

// ── Network ─────────────────────────────────────────────────────────

/// Radio and registration status of a modem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Percent, 0 when unknown.
    pub signal_quality: u32,
    /// Most capable technology in use; empty when there is none.
    pub access_technology: String,
    pub registration_state: RegistrationState,
    pub registered_operator: RegisteredOperator,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredOperator {
    pub name: String,
    /// MCC+MNC.
    pub code: String,
}

/// `MMModem3gppRegistrationState`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Idle,
    Home,
    Searching,
    Denied,
    #[default]
    Unknown,
    Roaming,
    HomeSmsOnly,
    RoamingSmsOnly,
    EmergencyOnly,
    HomeCsfbNotPreferred,
    RoamingCsfbNotPreferred,
    AttachedRlos,
}

impl RegistrationState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => RegistrationState::Idle,
            1 => RegistrationState::Home,
            2 => RegistrationState::Searching,
            3 => RegistrationState::Denied,
            5 => RegistrationState::Roaming,
            6 => RegistrationState::HomeSmsOnly,
            7 => RegistrationState::RoamingSmsOnly,
            8 => RegistrationState::EmergencyOnly,
            9 => RegistrationState::HomeCsfbNotPreferred,
            10 => RegistrationState::RoamingCsfbNotPreferred,
            11 => RegistrationState::AttachedRlos,
            _ => RegistrationState::Unknown,
        }
    }
}

/// `MMModemAccessTechnology` bits, most capable first.
const ACCESS_TECHNOLOGIES: &[(u32, &str)] = &[
    (1 << 15, "5GNR"),
    (1 << 14, "LTE"),
    (1 << 16, "LTE Cat-M"),
    (1 << 17, "LTE NB-IoT"),
    (1 << 9, "HSPA+"),
    (1 << 8, "HSPA"),
    (1 << 7, "HSUPA"),
    (1 << 6, "HSDPA"),
    (1 << 5, "UMTS"),
    (1 << 4, "EDGE"),
    (1 << 3, "GPRS"),
    (1 << 1, "GSM"),
    (1 << 2, "GSM Compact"),
    (1 << 13, "EVDO B"),
    (1 << 12, "EVDO A"),
    (1 << 11, "EVDO 0"),
    (1 << 10, "1xRTT"),
    (1 << 0, "POTS"),
];

/// Label of the most capable technology set in an `MMModemAccessTechnology`
/// bitmask.
pub fn access_technology_label(mask: u32) -> &'static str {
    ACCESS_TECHNOLOGIES
        .iter()
        .find(|(bit, _)| mask & bit != 0)
        .map(|(_, label)| *label)
        .unwrap_or("")
}

// ── eSIM ────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid iccid {0:?}")]
pub struct InvalidIccid(pub String);

/// Integrated Circuit Card Identifier.
///
/// Stored in its printable form: 18–20 decimal digits, optionally followed by
/// the `F` filler nibble some cards report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Iccid(String);

impl Iccid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Iccid {
    type Err = InvalidIccid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.trim_end_matches(['F', 'f']);
        let padding = trimmed.len() - digits.len();
        if !(18..=20).contains(&digits.len())
            || padding > 1
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(InvalidIccid(s.to_string()));
        }
        Ok(Iccid(digits.to_string()))
    }
}

impl TryFrom<String> for Iccid {
    type Error = InvalidIccid;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Iccid> for String {
    fn from(value: Iccid) -> Self {
        value.0
    }
}

impl std::fmt::Display for Iccid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-eUICC notification counter.
pub type SequenceNumber = u32;

/// Profile lifecycle event a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOperation {
    Install,
    Enable,
    Disable,
    Delete,
}

impl std::fmt::Display for NotificationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationOperation::Install => write!(f, "install"),
            NotificationOperation::Enable => write!(f, "enable"),
            NotificationOperation::Disable => write!(f, "disable"),
            NotificationOperation::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileState {
    Disabled,
    Enabled,
}

impl ProfileState {
    pub fn as_raw(self) -> u8 {
        match self {
            ProfileState::Disabled => 0,
            ProfileState::Enabled => 1,
        }
    }
}

impl std::fmt::Display for ProfileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileState::Disabled => write!(f, "disabled"),
            ProfileState::Enabled => write!(f, "enabled"),
        }
    }
}

/// Profile as shown in the eSIM list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    /// Nickname when set, otherwise the operator-provided profile name.
    pub name: String,
    pub service_provider_name: String,
    pub iccid: String,
    /// `data:` URI, empty when the profile carries no icon.
    pub icon: String,
    pub profile_state: u8,
}

/// Notification as shown in the notification list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    /// Stringified so JavaScript clients never lose precision.
    pub sequence_number: String,
    pub iccid: String,
    pub smdp: String,
    pub operation: NotificationOperation,
}

/// A download an SM-DS holds for the eUICC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredProfile {
    /// Matching id to start the download with.
    pub event_id: String,
    /// SM-DP+ address.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EuiccSummary {
    pub eid: String,
    pub free_space: i32,
    pub sas_accreditation_number: String,
    pub certificates: Vec<String>,
}
