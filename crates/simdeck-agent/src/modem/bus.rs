//! The device bus the registry consumes.
//!
//! [`ModemBus`] is implemented over ModemManager in [`super::dbus`] and in
//! memory in [`crate::simulate`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use simdeck_common::models::Sim;

use crate::error::Result;

/// Raw modem properties as the bus reports them.
///
/// Port names are bare (`cdc-wdm0`); the registry turns them into device
/// paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemProperties {
    pub device: String,
    pub manufacturer: String,
    pub equipment_identifier: String,
    pub drivers: Vec<String>,
    pub model: String,
    pub revision: String,
    pub hardware_revision: String,
    /// `MMModemState`.
    pub state: i32,
    pub primary_port: String,
    /// `(name, MMModemPortType)` pairs.
    pub ports: Vec<(String, u32)>,
    pub primary_sim_slot: u32,
    /// Object path of the active SIM, `/` when there is none.
    pub sim: String,
    /// Object paths of every slot, `/` for empty ones.
    pub sim_slots: Vec<String>,
    pub own_numbers: Vec<String>,
}

/// Raw radio status of a modem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkProperties {
    /// Percent.
    pub signal_quality: u32,
    /// `MMModemAccessTechnology` bitmask.
    pub access_technologies: u32,
    /// `MMModem3gppRegistrationState`.
    pub registration_state: u32,
    pub operator_name: String,
    pub operator_code: String,
}

/// Hot-plug notification, delivered in the order the bus emitted them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    Added { path: String },
    Removed { path: String },
}

#[async_trait]
pub trait ModemBus: Send + Sync {
    /// Object paths of every modem currently managed.
    async fn managed_modems(&self) -> Result<Vec<String>>;

    async fn modem(&self, path: &str) -> Result<ModemProperties>;

    async fn sim(&self, path: &str) -> Result<Sim>;

    async fn network(&self, path: &str) -> Result<NetworkProperties>;

    /// Start listening for added/removed modems.
    async fn signals(&self) -> Result<BoxStream<'static, BusSignal>>;

    async fn enable(&self, path: &str, enable: bool) -> Result<()>;

    async fn set_primary_sim_slot(&self, path: &str, slot: u32) -> Result<()>;

    /// Inhibit (or release) a device by its sysfs uid. Releasing makes the
    /// modem manager probe the device again.
    async fn inhibit_device(&self, uid: &str, inhibit: bool) -> Result<()>;

    /// Power-cycle the SIM in `slot` over QMI.
    async fn power_cycle_sim(&self, qmi_port: &str, slot: u32) -> Result<()>;
}
