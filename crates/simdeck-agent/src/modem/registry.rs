//! Device registry and hot-plug event bus.
//!
//! Keeps the last known inventory keyed by bus path and fans out added /
//! removed events to subscribers. One listener task per registry drives all
//! subscribers; it is started by the first successful [`Registry::subscribe`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, OnceCell};

use simdeck_common::models::{
    access_technology_label, Device, ModemPort, ModemState, NetworkStatus, PortType,
    RegisteredOperator, RegistrationState, Sim,
};

use super::bus::{BusSignal, ModemBus, ModemProperties};
use crate::error::{Error, Result};

/// Point-in-time view of the inventory, keyed by bus path.
pub type Snapshot = Arc<BTreeMap<String, Device>>;

/// Delay between the steps of a restart that touch the SIM.
const SIM_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Removed,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: EventKind,
    /// Bus path the event concerns.
    pub path: String,
    /// The new device for `Added`, the last known one (if any) for `Removed`.
    pub device: Option<Device>,
    /// Inventory after the event was applied.
    pub snapshot: Snapshot,
}

type Handler = Arc<dyn Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    bus: Arc<dyn ModemBus>,
    devices: RwLock<BTreeMap<String, Device>>,
    subscribers: Mutex<BTreeMap<u64, Handler>>,
    next_id: AtomicU64,
    listener: OnceCell<()>,
}

impl Registry {
    pub fn new(bus: Arc<dyn ModemBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                devices: RwLock::new(BTreeMap::new()),
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                listener: OnceCell::new(),
            }),
        }
    }

    // ── Inventory ───────────────────────────────────────────────

    /// Enumerate every managed modem and replace the inventory with the
    /// result.
    pub async fn modems(&self) -> Result<Snapshot> {
        let paths = self.inner.bus.managed_modems().await?;
        let mut fresh = BTreeMap::new();
        for path in paths {
            match self.inner.build_device(&path).await {
                Ok(device) => {
                    fresh.insert(path, device);
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "skipping modem"),
            }
        }
        let snapshot = Arc::new(fresh.clone());
        *self.inner.devices_write() = fresh;
        Ok(snapshot)
    }

    /// Inventory as last seen, without touching the bus.
    pub fn snapshot(&self) -> Snapshot {
        Arc::new(self.inner.devices_read().clone())
    }

    /// Refresh the inventory and return the modem with this identity.
    pub async fn find(&self, identity: &str) -> Result<Device> {
        let snapshot = self.modems().await?;
        snapshot
            .values()
            .find(|device| device.equipment_identifier == identity)
            .cloned()
            .ok_or_else(|| Error::ModemNotFound(identity.to_string()))
    }

    pub async fn sim(&self, path: &str) -> Result<Sim> {
        self.inner.bus.sim(path).await
    }

    /// The SIM in every occupied slot of `device`, in slot order.
    pub async fn sim_slots(&self, device: &Device) -> Result<Vec<Sim>> {
        let mut sims = Vec::with_capacity(device.sim_slots.len());
        for path in &device.sim_slots {
            sims.push(self.inner.bus.sim(path).await?);
        }
        Ok(sims)
    }

    pub async fn network(&self, device: &Device) -> Result<NetworkStatus> {
        let raw = self.inner.bus.network(&device.path).await?;
        Ok(NetworkStatus {
            signal_quality: raw.signal_quality,
            access_technology: access_technology_label(raw.access_technologies).to_string(),
            registration_state: RegistrationState::from_raw(raw.registration_state),
            registered_operator: RegisteredOperator {
                name: raw.operator_name,
                code: raw.operator_code,
            },
        })
    }

    // ── Subscriptions ───────────────────────────────────────────

    /// Register `handler` for every subsequent added / removed event.
    ///
    /// The first call starts the signal listener. If that fails the handler
    /// is removed again and the next call retries.
    pub async fn subscribe<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().insert(id, Arc::new(handler));

        let started = self
            .inner
            .listener
            .get_or_try_init(|| self.start_listener())
            .await;
        if let Err(e) = started {
            self.inner.subscribers().remove(&id);
            return Err(e);
        }

        Ok(Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    async fn start_listener(&self) -> Result<()> {
        let mut signals = self.inner.bus.signals().await?;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_signal(signal).await;
            }
            tracing::debug!("modem signal listener stopped");
        });
        tracing::debug!("modem signal listener started");
        Ok(())
    }

    /// Arm a watch for `identity` to (re)appear.
    ///
    /// Arm it before triggering whatever makes the modem re-enumerate so the
    /// Added event cannot slip past.
    pub async fn watch_device(&self, identity: &str) -> Result<DeviceWatch> {
        let (tx, rx) = mpsc::channel(1);
        let wanted = identity.to_string();
        let subscription = self
            .subscribe(move |event| {
                if event.kind != EventKind::Added {
                    return Ok(());
                }
                if let Some(device) = &event.device {
                    if device.equipment_identifier == wanted {
                        let _ = tx.try_send(device.clone());
                    }
                }
                Ok(())
            })
            .await?;
        Ok(DeviceWatch {
            identity: identity.to_string(),
            rx,
            _subscription: subscription,
        })
    }

    /// Block until a modem with `identity` is added, or `timeout` passes.
    pub async fn wait_for_device(&self, identity: &str, timeout: Duration) -> Result<Device> {
        self.watch_device(identity).await?.wait(timeout).await
    }

    // ── Control ─────────────────────────────────────────────────

    /// Restart a modem so that a profile switch takes effect.
    ///
    /// QMI modems get their SIM power-cycled first. With `compatible` set
    /// the device is also inhibited and released, which makes the modem
    /// manager probe it from scratch. Every step runs; failures are
    /// reported together.
    pub async fn restart(&self, device: &Device, compatible: bool) -> Result<()> {
        let bus = &self.inner.bus;
        let mut failures = Vec::new();

        if device.primary_port_type() == PortType::Qmi {
            let slot = device.primary_sim_slot.max(1);
            if let Err(e) = bus.power_cycle_sim(&device.primary_port, slot).await {
                failures.push(format!("sim power cycle: {e}"));
            }
            tokio::time::sleep(SIM_SETTLE).await;
        }

        if let Err(e) = bus.enable(&device.path, false).await {
            failures.push(format!("disable: {e}"));
        }
        if let Err(e) = bus.enable(&device.path, true).await {
            failures.push(format!("enable: {e}"));
        }

        if compatible {
            tokio::time::sleep(SIM_SETTLE).await;
            if let Err(e) = bus.inhibit_device(&device.device, true).await {
                failures.push(format!("inhibit: {e}"));
            }
            if let Err(e) = bus.inhibit_device(&device.device, false).await {
                failures.push(format!("uninhibit: {e}"));
            }
        }

        if failures.is_empty() {
            tracing::info!(modem = %device.equipment_identifier, compatible, "modem restarted");
            Ok(())
        } else {
            Err(Error::Transport(format!("restart: {}", failures.join("; "))))
        }
    }

    pub async fn set_primary_sim_slot(&self, device: &Device, slot: u32) -> Result<()> {
        self.inner.bus.set_primary_sim_slot(&device.path, slot).await
    }
}

impl Inner {
    fn devices_read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Device>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }

    fn devices_write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Device>> {
        self.devices.write().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, BTreeMap<u64, Handler>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn build_device(&self, path: &str) -> Result<Device> {
        let mut props = self.bus.modem(path).await?;

        if ModemState::from_raw(props.state) == ModemState::Disabled {
            tracing::info!(path = %path, "enabling disabled modem");
            match self.bus.enable(path, true).await {
                Ok(()) => props = self.bus.modem(path).await?,
                Err(e) => tracing::warn!(path = %path, error = %e, "failed to enable modem"),
            }
        }

        let sim = if props.sim.is_empty() || props.sim == "/" {
            None
        } else {
            Some(self.bus.sim(&props.sim).await?)
        };

        Ok(device_from_properties(path, props, sim))
    }

    async fn handle_signal(&self, signal: BusSignal) {
        let (event, handlers) = match signal {
            BusSignal::Added { path } => {
                let device = match self.build_device(&path).await {
                    Ok(device) => device,
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "failed to build added modem");
                        return;
                    }
                };
                let mut devices = self.devices_write();
                // A modem that re-enumerated keeps its identity but gets a
                // new path; drop the stale entry.
                devices.retain(|known_path, known| {
                    known_path == &path || known.equipment_identifier != device.equipment_identifier
                });
                devices.insert(path.clone(), device.clone());
                tracing::info!(path = %path, modem = %device.equipment_identifier, "modem added");
                let event = DeviceEvent {
                    kind: EventKind::Added,
                    path,
                    device: Some(device),
                    snapshot: Arc::new(devices.clone()),
                };
                (event, self.handlers())
            }
            BusSignal::Removed { path } => {
                let mut devices = self.devices_write();
                let device = devices.remove(&path);
                tracing::info!(
                    path = %path,
                    modem = device.as_ref().map(|d| d.equipment_identifier.as_str()).unwrap_or("unknown"),
                    "modem removed"
                );
                let event = DeviceEvent {
                    kind: EventKind::Removed,
                    path,
                    device,
                    snapshot: Arc::new(devices.clone()),
                };
                (event, self.handlers())
            }
        };

        for handler in handlers {
            if let Err(e) = handler(&event) {
                tracing::warn!(path = %event.path, error = %e, "device event handler failed");
            }
        }
    }

    fn handlers(&self) -> Vec<Handler> {
        self.subscribers().values().cloned().collect()
    }
}

fn device_from_properties(path: &str, props: ModemProperties, sim: Option<Sim>) -> Device {
    Device {
        path: path.to_string(),
        equipment_identifier: props.equipment_identifier,
        device: props.device,
        manufacturer: props.manufacturer,
        model: props.model,
        firmware_revision: props.revision,
        hardware_revision: props.hardware_revision,
        driver: props.drivers.into_iter().next().unwrap_or_default(),
        number: props.own_numbers.into_iter().next(),
        primary_port: format!("/dev/{}", props.primary_port),
        ports: props
            .ports
            .into_iter()
            .map(|(name, kind)| ModemPort {
                port_type: PortType::from_raw(kind),
                device: format!("/dev/{name}"),
            })
            .collect(),
        sim_slots: props
            .sim_slots
            .into_iter()
            .filter(|slot| slot != "/")
            .collect(),
        primary_sim_slot: props.primary_sim_slot,
        sim,
        state: ModemState::from_raw(props.state),
    }
}

/// Keeps a handler registered until dropped or unsubscribed.
#[must_use = "the handler is removed as soon as the subscription is dropped"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers().remove(&self.id);
        }
    }
}

/// An armed wait for one modem to appear.
pub struct DeviceWatch {
    identity: String,
    rx: mpsc::Receiver<Device>,
    _subscription: Subscription,
}

impl DeviceWatch {
    pub async fn wait(mut self, timeout: Duration) -> Result<Device> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(Error::Transport("device registry shut down".into())),
            Err(_) => {
                tracing::warn!(modem = %self.identity, ?timeout, "modem did not come back");
                Err(Error::DeadlineExceeded)
            }
        }
    }
}
