//! In-memory [`ModemBus`].
//!
//! Behaves like ModemManager where the registry cares: a disable/enable
//! cycle or a slot switch makes the modem drop off the bus and come back
//! under a new object path shortly afterwards.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use simdeck_common::models::Sim;

use crate::error::{Error, Result};
use crate::modem::bus::{BusSignal, ModemBus, ModemProperties, NetworkProperties};

const MODEM_PREFIX: &str = "/org/freedesktop/ModemManager1/Modem";
const SIM_PREFIX: &str = "/org/freedesktop/ModemManager1/SIM";

/// Control calls the bus received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Enable(String, bool),
    SetPrimarySimSlot(String, u32),
    Inhibit(String, bool),
    PowerCycleSim(String, u32),
}

#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

struct BusState {
    modems: BTreeMap<String, ModemProperties>,
    sims: BTreeMap<String, Sim>,
    /// Radio status by IMEI, so it survives re-enumeration.
    networks: BTreeMap<String, NetworkProperties>,
    broken: HashSet<String>,
    host_disabled: HashSet<String>,
    listeners: Vec<mpsc::UnboundedSender<BusSignal>>,
    calls: Vec<BusCall>,
    next_modem: u32,
    next_sim: u32,
    signal_failures: u32,
    registrations: usize,
    fail_enumeration: bool,
    reenumerate_delay: Duration,
}

impl BusState {
    fn emit(&mut self, signal: BusSignal) {
        self.listeners.retain(|tx| tx.send(signal.clone()).is_ok());
    }

    fn next_modem_path(&mut self) -> String {
        let path = format!("{MODEM_PREFIX}/{}", self.next_modem);
        self.next_modem += 1;
        path
    }

    fn next_sim_path(&mut self) -> String {
        let path = format!("{SIM_PREFIX}/{}", self.next_sim);
        self.next_sim += 1;
        path
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                modems: BTreeMap::new(),
                sims: BTreeMap::new(),
                networks: BTreeMap::new(),
                broken: HashSet::new(),
                host_disabled: HashSet::new(),
                listeners: Vec::new(),
                calls: Vec::new(),
                next_modem: 0,
                next_sim: 0,
                signal_failures: 0,
                registrations: 0,
                fail_enumeration: false,
                reenumerate_delay: Duration::from_millis(50),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a modem. A modem without a SIM path gets one active SIM.
    pub fn plug(&self, mut props: ModemProperties) -> String {
        let mut state = self.state();
        if props.sim.is_empty() {
            let sim_path = state.next_sim_path();
            let sim = Sim {
                path: sim_path.clone(),
                active: true,
                identifier: iccid_for(&props.equipment_identifier, 0),
                eid: format!("89049032{:0>24}", props.equipment_identifier),
                imsi: format!("23415{:0>10}", &props.equipment_identifier[..10.min(props.equipment_identifier.len())]),
                operator_identifier: "23415".into(),
                operator_name: "Simulated".into(),
            };
            state.sims.insert(sim_path.clone(), sim);
            props.sim = sim_path.clone();
            props.sim_slots = vec![sim_path];
        }
        let path = state.next_modem_path();
        state.modems.insert(path.clone(), props);
        state.emit(BusSignal::Added { path: path.clone() });
        path
    }

    /// Add an inactive SIM in a new slot of an attached modem.
    pub fn add_sim_slot(&self, modem_path: &str, identifier: &str) -> Option<String> {
        let mut state = self.state();
        if !state.modems.contains_key(modem_path) {
            return None;
        }
        let sim_path = state.next_sim_path();
        state.sims.insert(
            sim_path.clone(),
            Sim {
                path: sim_path.clone(),
                active: false,
                identifier: identifier.to_string(),
                ..Default::default()
            },
        );
        let props = state.modems.get_mut(modem_path)?;
        props.sim_slots.push(sim_path.clone());
        if props.primary_sim_slot == 0 {
            props.primary_sim_slot = 1;
        }
        Some(sim_path)
    }

    /// Set the radio status reported for `identity`.
    pub fn set_network(&self, identity: &str, network: NetworkProperties) {
        self.state().networks.insert(identity.to_string(), network);
    }

    pub fn unplug(&self, path: &str) {
        let mut state = self.state();
        if state.modems.remove(path).is_some() {
            state.emit(BusSignal::Removed {
                path: path.to_string(),
            });
        }
    }

    /// Re-announce a modem under a new path without a removal first.
    pub fn reappear(&self, identity: &str) -> Option<String> {
        let mut state = self.state();
        let old = state
            .modems
            .iter()
            .find(|(_, props)| props.equipment_identifier == identity)
            .map(|(path, _)| path.clone())?;
        let props = state.modems.remove(&old)?;
        let path = state.next_modem_path();
        state.modems.insert(path.clone(), props);
        state.emit(BusSignal::Added { path: path.clone() });
        Some(path)
    }

    pub fn emit(&self, signal: BusSignal) {
        self.state().emit(signal);
    }

    /// Make property reads of `path` fail.
    pub fn break_modem(&self, path: &str) {
        self.state().broken.insert(path.to_string());
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state().fail_enumeration = fail;
    }

    /// Refuse the next `count` signal registrations.
    pub fn fail_signal_registrations(&self, count: u32) {
        self.state().signal_failures = count;
    }

    pub fn set_reenumerate_delay(&self, delay: Duration) {
        self.state().reenumerate_delay = delay;
    }

    /// Successful signal registrations so far.
    pub fn signal_registrations(&self) -> usize {
        self.state().registrations
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.state().calls.clone()
    }

    pub fn path_of(&self, identity: &str) -> Option<String> {
        self.state()
            .modems
            .iter()
            .find(|(_, props)| props.equipment_identifier == identity)
            .map(|(path, _)| path.clone())
    }

    /// Drop the modem off the bus and bring it back under a new path.
    fn reenumerate(&self, path: &str) {
        let delay = self.state().reenumerate_delay;
        let bus = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = bus.state();
            let Some(mut props) = state.modems.remove(&path) else {
                return;
            };
            state.emit(BusSignal::Removed { path: path.clone() });
            props.state = 8;
            let fresh = state.next_modem_path();
            state.modems.insert(fresh.clone(), props);
            state.emit(BusSignal::Added { path: fresh });
        });
    }
}

#[async_trait]
impl ModemBus for SimulatedBus {
    async fn managed_modems(&self) -> Result<Vec<String>> {
        let state = self.state();
        if state.fail_enumeration {
            return Err(Error::Transport("ModemManager is not running".into()));
        }
        Ok(state.modems.keys().cloned().collect())
    }

    async fn modem(&self, path: &str) -> Result<ModemProperties> {
        let state = self.state();
        if state.broken.contains(path) {
            return Err(Error::Transport(format!("reading {path}: object vanished")));
        }
        state
            .modems
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown object {path}")))
    }

    async fn sim(&self, path: &str) -> Result<Sim> {
        self.state()
            .sims
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown object {path}")))
    }

    async fn network(&self, path: &str) -> Result<NetworkProperties> {
        let state = self.state();
        if state.broken.contains(path) {
            return Err(Error::Transport(format!("reading {path}: object vanished")));
        }
        let props = state
            .modems
            .get(path)
            .ok_or_else(|| Error::Transport(format!("unknown object {path}")))?;
        Ok(state
            .networks
            .get(&props.equipment_identifier)
            .cloned()
            .unwrap_or_else(|| NetworkProperties {
                signal_quality: 72,
                access_technologies: 1 << 14,
                registration_state: 1,
                operator_name: "Simulated".into(),
                operator_code: "23415".into(),
            }))
    }

    async fn signals(&self) -> Result<BoxStream<'static, BusSignal>> {
        let mut state = self.state();
        if state.signal_failures > 0 {
            state.signal_failures -= 1;
            return Err(Error::Transport("signal registration refused".into()));
        }
        state.registrations += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn enable(&self, path: &str, enable: bool) -> Result<()> {
        let reenumerate = {
            let mut state = self.state();
            state.calls.push(BusCall::Enable(path.to_string(), enable));
            let props = state
                .modems
                .get_mut(path)
                .ok_or_else(|| Error::Transport(format!("unknown object {path}")))?;
            props.state = if enable { 6 } else { 3 };
            if enable {
                state.host_disabled.remove(path)
            } else {
                state.host_disabled.insert(path.to_string());
                false
            }
        };
        if reenumerate {
            self.reenumerate(path);
        }
        Ok(())
    }

    async fn set_primary_sim_slot(&self, path: &str, slot: u32) -> Result<()> {
        {
            let mut state = self.state();
            state
                .calls
                .push(BusCall::SetPrimarySimSlot(path.to_string(), slot));
            let slots = state
                .modems
                .get(path)
                .map(|props| props.sim_slots.clone())
                .ok_or_else(|| Error::Transport(format!("unknown object {path}")))?;
            let index = slot as usize;
            if index == 0 || index > slots.len() {
                return Err(Error::Transport(format!("invalid sim slot {slot}")));
            }
            for (i, sim_path) in slots.iter().enumerate() {
                if let Some(sim) = state.sims.get_mut(sim_path) {
                    sim.active = i + 1 == index;
                }
            }
            if let Some(props) = state.modems.get_mut(path) {
                props.primary_sim_slot = slot;
                props.sim = slots[index - 1].clone();
            }
        }
        self.reenumerate(path);
        Ok(())
    }

    async fn inhibit_device(&self, uid: &str, inhibit: bool) -> Result<()> {
        self.state()
            .calls
            .push(BusCall::Inhibit(uid.to_string(), inhibit));
        Ok(())
    }

    async fn power_cycle_sim(&self, qmi_port: &str, slot: u32) -> Result<()> {
        self.state()
            .calls
            .push(BusCall::PowerCycleSim(qmi_port.to_string(), slot));
        Ok(())
    }
}

/// Properties of a typical USB modem with its primary port of `port_type`.
pub fn modem_properties(imei: &str, primary_port: &str, port_type: u32) -> ModemProperties {
    let driver = match port_type {
        6 => "qmi_wwan",
        7 => "cdc_mbim",
        _ => "option",
    };
    ModemProperties {
        device: format!("/sys/devices/platform/usb/{imei}"),
        manufacturer: "Quectel".into(),
        equipment_identifier: imei.to_string(),
        drivers: vec![driver.to_string()],
        model: "EM12-G".into(),
        revision: "EM12GPAR01A21M4G".into(),
        hardware_revision: "10000".into(),
        state: 8,
        primary_port: primary_port.to_string(),
        ports: vec![(primary_port.to_string(), port_type), ("wwan0".into(), 2)],
        primary_sim_slot: 0,
        sim: String::new(),
        sim_slots: Vec::new(),
        own_numbers: vec!["+447700900123".into()],
    }
}

/// A syntactically valid ICCID derived from an IMEI.
pub fn iccid_for(imei: &str, index: u32) -> String {
    let digits: String = imei.chars().filter(|c| c.is_ascii_digit()).collect();
    let tail = &digits[digits.len().saturating_sub(11)..];
    format!("8944{index:04}{tail:0>11}")
}
