//! Shared application state.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use simdeck_common::protocol::{InventoryEvent, ModemAddedPayload, ModemRemovedPayload};

use crate::config::SettingsStore;
use crate::error::Result;
use crate::modem::registry::{EventKind, Registry, Subscription};
use crate::service::ProvisioningService;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    service: ProvisioningService,
    /// Broadcast channel for inventory WebSocket subscribers.
    inventory_tx: broadcast::Sender<InventoryEvent>,
    /// Registry subscription feeding `inventory_tx`, once started.
    relay: Mutex<Option<Subscription>>,
}

impl AppState {
    pub fn new(service: ProvisioningService) -> Self {
        let (inventory_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                service,
                inventory_tx,
                relay: Mutex::new(None),
            }),
        }
    }

    pub fn service(&self) -> &ProvisioningService {
        &self.inner.service
    }

    pub fn registry(&self) -> &Registry {
        self.inner.service.registry()
    }

    pub fn settings(&self) -> &SettingsStore {
        self.inner.service.settings()
    }

    pub fn subscribe_inventory(&self) -> broadcast::Receiver<InventoryEvent> {
        self.inner.inventory_tx.subscribe()
    }

    /// Forward registry hot-plug events to inventory subscribers. Calling it
    /// again after it succeeded does nothing.
    pub async fn start_inventory_relay(&self) -> Result<()> {
        // Held across the subscribe so concurrent callers start one relay.
        let mut relay = self.inner.relay.lock().await;
        if relay.is_some() {
            return Ok(());
        }
        let tx = self.inner.inventory_tx.clone();
        let subscription = self
            .registry()
            .subscribe(move |event| {
                let message = match event.kind {
                    EventKind::Added => {
                        let modem = event
                            .device
                            .clone()
                            .ok_or_else(|| anyhow::anyhow!("added event for {} without device", event.path))?;
                        InventoryEvent::Added(ModemAddedPayload { modem })
                    }
                    EventKind::Removed => InventoryEvent::Removed(ModemRemovedPayload {
                        path: event.path.clone(),
                        modem: event.device.clone(),
                    }),
                };
                let _ = tx.send(message);
                Ok(())
            })
            .await?;
        *relay = Some(subscription);
        tracing::debug!("inventory relay started");
        Ok(())
    }
}
