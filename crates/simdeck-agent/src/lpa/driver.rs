//! APDU transports to a modem's secure element.

use std::sync::Arc;

use async_trait::async_trait;

use simdeck_common::models::{Device, PortType};

use crate::error::{Error, Result};

/// An open APDU channel to one modem's UICC.
#[async_trait]
pub trait SecureElementChannel: Send + Sync {
    /// Send one command APDU and return the response (including SW1/SW2).
    async fn transmit(&self, command: &[u8]) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;

    /// Character device the channel runs over.
    fn port(&self) -> &str;
}

/// Opens channels over the modem's control protocols.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    async fn open_at(&self, port: &str) -> Result<Arc<dyn SecureElementChannel>>;

    async fn open_qmi(&self, port: &str, slot: u32) -> Result<Arc<dyn SecureElementChannel>>;

    async fn open_mbim(&self, port: &str, slot: u32) -> Result<Arc<dyn SecureElementChannel>>;
}

/// Which driver to use for a modem, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPlan {
    At { port: String },
    Qmi { port: String, slot: u32 },
    Mbim { port: String, slot: u32 },
}

/// Pick the channel for `device`.
///
/// QMI and MBIM modems are driven over their primary port at the primary
/// SIM slot; everything else, or everything when `force_at` is set, goes
/// through the first AT port.
pub fn plan_channel(device: &Device, force_at: bool) -> Result<ChannelPlan> {
    if !force_at {
        let slot = device.primary_sim_slot.max(1);
        match device.primary_port_type() {
            PortType::Qmi => {
                return Ok(ChannelPlan::Qmi {
                    port: device.primary_port.clone(),
                    slot,
                })
            }
            PortType::Mbim => {
                return Ok(ChannelPlan::Mbim {
                    port: device.primary_port.clone(),
                    slot,
                })
            }
            _ => {}
        }
    }
    device
        .port(PortType::At)
        .map(|port| ChannelPlan::At {
            port: port.device.clone(),
        })
        .ok_or_else(|| Error::Channel("port not found".into()))
}

impl ChannelPlan {
    pub async fn open(&self, driver: &dyn ChannelDriver) -> Result<Arc<dyn SecureElementChannel>> {
        match self {
            ChannelPlan::At { port } => {
                tracing::info!(port = %port, "using AT driver");
                driver.open_at(port).await
            }
            ChannelPlan::Qmi { port, slot } => {
                tracing::info!(port = %port, slot, "using QMI driver");
                driver.open_qmi(port, *slot).await
            }
            ChannelPlan::Mbim { port, slot } => {
                tracing::info!(port = %port, slot, "using MBIM driver");
                driver.open_mbim(port, *slot).await
            }
        }
    }
}
