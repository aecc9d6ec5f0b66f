//! Agent configuration.
//!
//! Parsed from TOML into `*Input` structs where every field is optional,
//! then resolved into a validated [`Config`]. A missing file yields the
//! defaults.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9527";
pub const DEFAULT_ENVIRONMENT: &str = "production";
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest APDU segment a modem setting may ask for.
pub const MAX_MSS: usize = 255;

// ── Input ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub app: AppConfigInput,
    pub lpa: LpaConfigInput,
    pub modems: BTreeMap<String, ModemSettingsInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfigInput {
    pub environment: Option<String>,
    pub listen_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LpaConfigInput {
    pub force_at: bool,
    pub slowdown: bool,
    pub restart_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModemSettingsInput {
    pub alias: Option<String>,
    pub compatible: bool,
    pub mss: Option<usize>,
}

// ── Resolved ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub listen_address: SocketAddr,
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Clone)]
pub struct LpaConfig {
    pub force_at: bool,
    pub slowdown: bool,
    /// How long to wait for a modem to come back after a restart or a SIM
    /// slot switch.
    pub restart_timeout: Duration,
}

impl Default for LpaConfig {
    fn default() -> Self {
        Self {
            force_at: false,
            slowdown: false,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
        }
    }
}

/// Per-modem knobs, keyed by equipment identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Inhibit and release the device on restart so the modem manager
    /// reloads it from scratch.
    pub compatible: bool,
    /// APDU segment size override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mss: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub lpa: LpaConfig,
    pub modems: BTreeMap<String, ModemSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                environment: DEFAULT_ENVIRONMENT.to_string(),
                listen_address: SocketAddr::from(([0, 0, 0, 0], 9527)),
            },
            lpa: LpaConfig::default(),
            modems: BTreeMap::new(),
        }
    }
}

impl ConfigInput {
    pub fn resolve(self) -> Result<Config, String> {
        let environment = self
            .app
            .environment
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let listen = self
            .app
            .listen_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_LISTEN_ADDRESS);
        let listen_address: SocketAddr = listen
            .parse()
            .map_err(|e| format!("Invalid listen_address {listen:?}: {e}"))?;

        let restart_timeout = match self.lpa.restart_timeout_secs {
            Some(0) => return Err("restart_timeout_secs must be greater than zero".into()),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_RESTART_TIMEOUT,
        };

        let mut modems = BTreeMap::new();
        for (identity, input) in self.modems {
            let identity = identity.trim().to_string();
            if identity.is_empty() {
                continue;
            }
            let settings = ModemSettings {
                alias: normalize_alias(input.alias),
                compatible: input.compatible,
                mss: input.mss,
            };
            validate_mss(settings.mss).map_err(|e| format!("modems.{identity}: {e}"))?;
            modems.insert(identity, settings);
        }

        Ok(Config {
            app: AppConfig {
                environment,
                listen_address,
            },
            lpa: LpaConfig {
                force_at: self.lpa.force_at,
                slowdown: self.lpa.slowdown,
                restart_timeout,
            },
            modems,
        })
    }
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(Config::default());
        }
        let parsed: ConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    /// Load from `path`. A file that does not exist gives the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(format!("Failed to read {}: {}", path.display(), e)),
        }
    }
}

fn normalize_alias(alias: Option<String>) -> Option<String> {
    alias
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
}

fn validate_mss(mss: Option<usize>) -> std::result::Result<(), String> {
    match mss {
        Some(0) => Err("mss must be greater than zero".into()),
        Some(m) if m > MAX_MSS => Err(format!("mss must be {MAX_MSS} or less")),
        _ => Ok(()),
    }
}

// ── Runtime settings store ──────────────────────────────────────────

/// Body of a settings update. `compatible` must be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModemSettingsUpdate {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub compatible: Option<bool>,
    #[serde(default)]
    pub mss: Option<usize>,
}

/// Per-modem settings seeded from the config file and editable at runtime.
/// Edits live in memory only.
#[derive(Clone, Default)]
pub struct SettingsStore {
    modems: Arc<DashMap<String, ModemSettings>>,
}

impl SettingsStore {
    pub fn new(seed: BTreeMap<String, ModemSettings>) -> Self {
        Self {
            modems: Arc::new(seed.into_iter().collect()),
        }
    }

    /// Settings for `identity`, or the defaults when none are stored.
    pub fn get(&self, identity: &str) -> ModemSettings {
        self.modems
            .get(identity)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn update(&self, identity: &str, update: ModemSettingsUpdate) -> Result<ModemSettings> {
        let compatible = update
            .compatible
            .ok_or_else(|| Error::InvalidInput("compatible is required".into()))?;
        validate_mss(update.mss).map_err(Error::InvalidInput)?;

        let settings = ModemSettings {
            alias: normalize_alias(update.alias),
            compatible,
            mss: update.mss,
        };
        self.modems.insert(identity.to_string(), settings.clone());
        tracing::info!(modem = %identity, compatible, mss = ?settings.mss, "modem settings updated");
        Ok(settings)
    }
}
