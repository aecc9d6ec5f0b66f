//! WebSocket protocol messages.
//!
//! Two sockets are exposed by the agent: the inventory stream (`/ws`), which
//! wraps every message in an [`Envelope`], and the per-request download
//! socket, which speaks the flat `{"type": ...}` messages below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Device;

// ── Envelope ────────────────────────────────────────────────────────

/// The outer envelope for inventory stream messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message ID (UUIDv7, time-ordered).
    pub id: String,
    /// Message type (dotted namespace, e.g. "modem.added").
    #[serde(rename = "type")]
    pub msg_type: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a new envelope with a fresh UUIDv7 and current timestamp.
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            msg_type: msg_type.into(),
            ts: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    /// Parse the payload into a concrete type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ── Inventory stream ────────────────────────────────────────────────

/// Messages pushed to inventory subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InventoryEvent {
    /// Full inventory, sent once when a client connects.
    #[serde(rename = "modem.snapshot")]
    Snapshot(SnapshotPayload),

    #[serde(rename = "modem.added")]
    Added(ModemAddedPayload),

    #[serde(rename = "modem.removed")]
    Removed(ModemRemovedPayload),
}

impl InventoryEvent {
    pub fn msg_type(&self) -> &'static str {
        match self {
            InventoryEvent::Snapshot(_) => "modem.snapshot",
            InventoryEvent::Added(_) => "modem.added",
            InventoryEvent::Removed(_) => "modem.removed",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            InventoryEvent::Snapshot(p) => Envelope::new(self.msg_type(), p),
            InventoryEvent::Added(p) => Envelope::new(self.msg_type(), p),
            InventoryEvent::Removed(p) => Envelope::new(self.msg_type(), p),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub modems: Vec<Device>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemAddedPayload {
    pub modem: Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemRemovedPayload {
    pub path: String,
    /// Last known state; absent when the registry never saw the modem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modem: Option<Device>,
}

// ── Download socket: client → agent ─────────────────────────────────

/// Raw client frame. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadClientMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub smdp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub activation_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub confirmation_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessageType {
    Start,
    Confirm,
    ConfirmationCode,
    Cancel,
    Unknown,
}

impl DownloadClientMessage {
    /// Classify the frame. An empty `type` is read as `start`.
    pub fn message_type(&self) -> ClientMessageType {
        match self.kind.as_str() {
            "" | "start" => ClientMessageType::Start,
            "confirm" => ClientMessageType::Confirm,
            "confirmation_code" => ClientMessageType::ConfirmationCode,
            "cancel" => ClientMessageType::Cancel,
            _ => ClientMessageType::Unknown,
        }
    }

    pub fn start(smdp: impl Into<String>, activation_code: impl Into<String>) -> Self {
        Self {
            kind: "start".into(),
            smdp: smdp.into(),
            activation_code: activation_code.into(),
            ..Default::default()
        }
    }

    pub fn confirm(accept: bool) -> Self {
        Self {
            kind: "confirm".into(),
            accept: Some(accept),
            ..Default::default()
        }
    }

    pub fn confirmation_code(code: impl Into<String>) -> Self {
        Self {
            kind: "confirmation_code".into(),
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn cancel() -> Self {
        Self {
            kind: "cancel".into(),
            ..Default::default()
        }
    }
}

// ── Download socket: agent → client ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    Progress,
    Preview,
    ConfirmationCodeRequired,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfilePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DownloadServerMessage {
    fn bare(kind: ServerMessageType) -> Self {
        Self {
            kind,
            stage: None,
            profile: None,
            message: None,
        }
    }

    pub fn progress(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::bare(ServerMessageType::Progress)
        }
    }

    pub fn preview(profile: ProfilePreview) -> Self {
        Self {
            profile: Some(profile),
            ..Self::bare(ServerMessageType::Preview)
        }
    }

    pub fn confirmation_code_required() -> Self {
        Self::bare(ServerMessageType::ConfirmationCodeRequired)
    }

    pub fn completed() -> Self {
        Self::bare(ServerMessageType::Completed)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(ServerMessageType::Error)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ServerMessageType::Completed | ServerMessageType::Error
        )
    }
}

/// Profile metadata shown to the user before they accept a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePreview {
    pub iccid: String,
    pub service_provider_name: String,
    pub profile_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_nickname: Option<String>,
    pub profile_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_type: Option<String>,
    pub owner_mcc: String,
    pub owner_mnc: String,
}
