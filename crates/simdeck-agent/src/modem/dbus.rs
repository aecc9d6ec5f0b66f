//! ModemManager over the D-Bus system bus.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use zbus::fdo::ObjectManagerProxy;
use zbus::proxy::CacheProperties;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{proxy, Connection, MatchRule, MessageStream};

use simdeck_common::models::Sim;

use super::bus::{BusSignal, ModemBus, ModemProperties, NetworkProperties};
use crate::error::{Error, Result};

pub const SERVICE: &str = "org.freedesktop.ModemManager1";
pub const OBJECT_PATH: &str = "/org/freedesktop/ModemManager1";
pub const MODEM_INTERFACE: &str = "org.freedesktop.ModemManager1.Modem";

const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
const QMICLI: &str = "/usr/bin/qmicli";

#[proxy(
    default_service = "org.freedesktop.ModemManager1",
    default_path = "/org/freedesktop/ModemManager1",
    interface = "org.freedesktop.ModemManager1"
)]
trait ModemManager {
    fn inhibit_device(&self, uid: &str, inhibit: bool) -> zbus::Result<()>;
}

#[proxy(
    default_service = "org.freedesktop.ModemManager1",
    interface = "org.freedesktop.ModemManager1.Modem"
)]
trait MmModem {
    fn enable(&self, enable: bool) -> zbus::Result<()>;

    fn set_primary_sim_slot(&self, sim_slot: u32) -> zbus::Result<()>;

    #[zbus(property)]
    fn device(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn manufacturer(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn equipment_identifier(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn drivers(&self) -> zbus::Result<Vec<String>>;

    #[zbus(property)]
    fn model(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn revision(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn hardware_revision(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<i32>;

    #[zbus(property)]
    fn primary_port(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn ports(&self) -> zbus::Result<Vec<(String, u32)>>;

    /// 0 when the modem does not support multiple slots.
    #[zbus(property)]
    fn primary_sim_slot(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn sim(&self) -> zbus::Result<OwnedObjectPath>;

    #[zbus(property)]
    fn sim_slots(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    #[zbus(property)]
    fn own_numbers(&self) -> zbus::Result<Vec<String>>;

    /// `(percent, recent)`.
    #[zbus(property)]
    fn signal_quality(&self) -> zbus::Result<(u32, bool)>;

    #[zbus(property)]
    fn access_technologies(&self) -> zbus::Result<u32>;
}

#[proxy(
    default_service = "org.freedesktop.ModemManager1",
    interface = "org.freedesktop.ModemManager1.Modem.Modem3gpp"
)]
trait MmModem3gpp {
    #[zbus(property)]
    fn registration_state(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn operator_code(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn operator_name(&self) -> zbus::Result<String>;
}

#[proxy(
    default_service = "org.freedesktop.ModemManager1",
    interface = "org.freedesktop.ModemManager1.Sim"
)]
trait MmSim {
    #[zbus(property)]
    fn active(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn sim_identifier(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn eid(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn imsi(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn operator_identifier(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn operator_name(&self) -> zbus::Result<String>;
}

/// [`ModemBus`] backed by a running ModemManager.
#[derive(Clone)]
pub struct ModemManagerBus {
    conn: Connection,
}

impl ModemManagerBus {
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system().await?;
        tracing::info!("connected to system bus");
        Ok(Self { conn })
    }

    async fn modem_proxy(&self, path: &str) -> Result<MmModemProxy<'static>> {
        let proxy = MmModemProxy::builder(&self.conn)
            .path(path.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(proxy)
    }
}

#[async_trait]
impl ModemBus for ModemManagerBus {
    async fn managed_modems(&self) -> Result<Vec<String>> {
        let manager = ObjectManagerProxy::builder(&self.conn)
            .destination(SERVICE)?
            .path(OBJECT_PATH)?
            .build()
            .await?;
        let objects = manager.get_managed_objects().await?;
        let mut paths: Vec<String> = objects
            .into_iter()
            .filter(|(_, interfaces)| {
                interfaces
                    .keys()
                    .any(|iface| iface.as_str() == MODEM_INTERFACE)
            })
            .map(|(path, _)| path.to_string())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn modem(&self, path: &str) -> Result<ModemProperties> {
        let modem = self.modem_proxy(path).await?;
        Ok(ModemProperties {
            device: modem.device().await?,
            manufacturer: modem.manufacturer().await?,
            equipment_identifier: modem.equipment_identifier().await?,
            drivers: modem.drivers().await?,
            model: modem.model().await?,
            revision: modem.revision().await?,
            hardware_revision: modem.hardware_revision().await.unwrap_or_default(),
            state: modem.state().await?,
            primary_port: modem.primary_port().await?,
            ports: modem.ports().await?,
            primary_sim_slot: modem.primary_sim_slot().await.unwrap_or_default(),
            sim: modem.sim().await?.to_string(),
            sim_slots: modem
                .sim_slots()
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|slot| slot.to_string())
                .collect(),
            own_numbers: modem.own_numbers().await.unwrap_or_default(),
        })
    }

    async fn sim(&self, path: &str) -> Result<Sim> {
        let sim = MmSimProxy::builder(&self.conn)
            .path(path.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(Sim {
            path: path.to_string(),
            // Older ModemManager releases lack the property; a SIM they
            // expose is always the active one.
            active: sim.active().await.unwrap_or(true),
            identifier: sim.sim_identifier().await?,
            eid: sim.eid().await.unwrap_or_default(),
            imsi: sim.imsi().await.unwrap_or_default(),
            operator_identifier: sim.operator_identifier().await.unwrap_or_default(),
            operator_name: sim.operator_name().await.unwrap_or_default(),
        })
    }

    async fn network(&self, path: &str) -> Result<NetworkProperties> {
        let modem = self.modem_proxy(path).await?;
        let three_gpp = MmModem3gppProxy::builder(&self.conn)
            .path(path.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        let (signal_quality, _recent) = modem.signal_quality().await?;
        Ok(NetworkProperties {
            signal_quality,
            access_technologies: modem.access_technologies().await?,
            registration_state: three_gpp.registration_state().await?,
            operator_name: three_gpp.operator_name().await?,
            operator_code: three_gpp.operator_code().await?,
        })
    }

    async fn signals(&self) -> Result<BoxStream<'static, BusSignal>> {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(SERVICE)?
            .interface(OBJECT_MANAGER_INTERFACE)?
            .path(OBJECT_PATH)?
            .build();
        let messages = MessageStream::for_match_rule(rule, &self.conn, Some(64)).await?;

        let signals = messages.filter_map(|msg| async move {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(error = %e, "bad message on signal stream");
                    return None;
                }
            };
            let header = msg.header();
            let member = header.member()?.to_string();
            match member.as_str() {
                "InterfacesAdded" => {
                    let (path, interfaces): (
                        OwnedObjectPath,
                        HashMap<String, HashMap<String, OwnedValue>>,
                    ) = msg.body().deserialize().ok()?;
                    interfaces
                        .contains_key(MODEM_INTERFACE)
                        .then(|| BusSignal::Added {
                            path: path.to_string(),
                        })
                }
                "InterfacesRemoved" => {
                    let (path, interfaces): (OwnedObjectPath, Vec<String>) =
                        msg.body().deserialize().ok()?;
                    interfaces
                        .iter()
                        .any(|iface| iface == MODEM_INTERFACE)
                        .then(|| BusSignal::Removed {
                            path: path.to_string(),
                        })
                }
                _ => None,
            }
        });
        Ok(signals.boxed())
    }

    async fn enable(&self, path: &str, enable: bool) -> Result<()> {
        self.modem_proxy(path).await?.enable(enable).await?;
        Ok(())
    }

    async fn set_primary_sim_slot(&self, path: &str, slot: u32) -> Result<()> {
        self.modem_proxy(path)
            .await?
            .set_primary_sim_slot(slot)
            .await?;
        Ok(())
    }

    async fn inhibit_device(&self, uid: &str, inhibit: bool) -> Result<()> {
        ModemManagerProxy::new(&self.conn)
            .await?
            .inhibit_device(uid, inhibit)
            .await?;
        Ok(())
    }

    async fn power_cycle_sim(&self, qmi_port: &str, slot: u32) -> Result<()> {
        for action in ["off", "on"] {
            let output = tokio::process::Command::new(QMICLI)
                .args(["-d", qmi_port, "-p", &format!("--uim-sim-power-{action}={slot}")])
                .output()
                .await
                .map_err(|e| Error::Transport(format!("running qmicli: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::error!(port = %qmi_port, slot, action, stderr = %stderr.trim(), "qmicli failed");
                return Err(Error::Transport(format!(
                    "qmicli sim power {action}: {}",
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }
}
