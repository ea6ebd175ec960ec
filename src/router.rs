//! The router owns the two maps everything else meets in: which device link
//! serves a slot, and which clients currently observe it.
//!
//! Device read loops call [`Router::broadcast`], client gateways call
//! [`Router::route_to_device`], and the supervisor installs and removes
//! links as the mapping changes. All mutation goes through here; nobody
//! touches the maps directly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::Slot;
use crate::error::Error;
use crate::link::LinkHandle;

/// Identifies one connected client for registration purposes.
pub type ClientId = Uuid;

/// Inbound message switching every registered link into discovery.
pub const DISCOVER_ON_COMMAND: &str = "CATSAutoDiscover On";

/// Inbound message switching discovery off again.
pub const DISCOVER_OFF_COMMAND: &str = "CATSAutoDiscover Off";

/// Inbound message asking for a health log line per registered link.
pub const HEALTH_REPORT_COMMAND: &str = "CATSHealthReport";

/// The probe written to every device when discovery is switched on; devices
/// answer with their interface hardware addresses.
const DISCOVER_PROBE: &str = "cat /sys/class/net/*/address";

/// How a payload handed to [`Router::route_to_device`] should reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Text; a line terminator is appended when missing.
    Text,

    /// Hex text; decoded to raw bytes first, written unframed.
    Hex,

    /// Raw bytes, written unframed.
    Binary,
}

#[derive(Default)]
struct Maps {
    devices: HashMap<Slot, LinkHandle>,
    clients: HashMap<Slot, HashMap<ClientId, mpsc::UnboundedSender<String>>>,
}

/// Routes traffic between device links and the clients observing them.
///
/// Cheap to clone; all clones share the same maps. Locks are held only for
/// map access, never across I/O, so one slot's traffic cannot stall
/// another's.
#[derive(Clone, Default)]
pub struct Router {
    maps: Arc<RwLock<Maps>>,
}

impl Router {
    /// A router with no devices and no clients.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or overwrite) the device link serving `slot`. Subsequent
    /// routes to the slot reach this link.
    pub async fn register_device(&self, slot: Slot, link: LinkHandle) {
        debug!(%slot, "Registering device link");
        self.maps.write().await.devices.insert(slot, link);
    }

    /// Remove the device link for `slot`, if any. Clients of the slot stay
    /// registered; their routes fail with [`Error::UnknownSlot`] until a new
    /// link is installed.
    pub async fn unregister_device(&self, slot: Slot) -> Option<LinkHandle> {
        debug!(%slot, "Unregistering device link");
        self.maps.write().await.devices.remove(&slot)
    }

    /// Add a client observing `slot`. Fails when no device serves the slot.
    /// Re-registering the same client id just replaces its outbox.
    pub async fn register_client(
        &self,
        slot: Slot,
        id: ClientId,
        outbox: mpsc::UnboundedSender<String>,
    ) -> Result<(), Error> {
        let mut maps = self.maps.write().await;

        if !maps.devices.contains_key(&slot) {
            return Err(Error::UnknownSlot(slot.to_string()));
        }

        maps.clients.entry(slot).or_default().insert(id, outbox);
        info!(%slot, %id, "Client registered");

        Ok(())
    }

    /// Remove a client from `slot`. A no-op when it was never registered.
    pub async fn unregister_client(&self, slot: Slot, id: ClientId) {
        let mut maps = self.maps.write().await;

        if let Some(clients) = maps.clients.get_mut(&slot) {
            if clients.remove(&id).is_some() {
                info!(%slot, %id, "Client unregistered");
            }
            if clients.is_empty() {
                maps.clients.remove(&slot);
            }
        }
    }

    /// Forward a payload to the device serving `slot`.
    pub async fn route_to_device(
        &self,
        slot: Slot,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<(), Error> {
        let link = self
            .maps
            .read()
            .await
            .devices
            .get(&slot)
            .cloned()
            .ok_or_else(|| Error::UnknownSlot(slot.to_string()))?;

        match kind {
            WriteKind::Text => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| Error::Decode(format!("Text payload is not UTF-8: {e}")))?;
                link.send_text(text)
            }
            WriteKind::Hex => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| Error::InvalidEncoding(format!("Hex payload is not text: {e}")))?;
                link.send_hex(text)
            }
            WriteKind::Binary => link.send_binary(payload.to_vec()),
        }
    }

    /// Fan a device line out to every client of `slot`, best effort.
    ///
    /// Deliveries are independent: a client whose transport is gone does not
    /// keep the line from the others, it just gets dropped from the map.
    pub async fn broadcast(&self, slot: Slot, line: &str) {
        let dead = {
            let maps = self.maps.read().await;

            let Some(clients) = maps.clients.get(&slot) else {
                return;
            };

            clients
                .iter()
                .filter(|(_, outbox)| outbox.send(line.to_string()).is_err())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
        };

        for id in dead {
            debug!(%slot, %id, "Dropping client with closed transport");
            self.unregister_client(slot, id).await;
        }
    }

    /// Handle a global control message. Returns `false` when the message is
    /// not one, in which case it should be routed to the slot's device like
    /// any other payload.
    pub async fn handle_global_command(&self, message: &str) -> bool {
        match message {
            DISCOVER_ON_COMMAND => {
                info!("Switching discovery on for all links");
                for (slot, link) in &self.maps.read().await.devices {
                    if let Err(e) = link.send_discover_probe(DISCOVER_PROBE) {
                        warn!(%slot, "Could not probe: {e}");
                    }
                }
                true
            }
            DISCOVER_OFF_COMMAND => {
                info!("Switching discovery off for all links");
                for link in self.maps.read().await.devices.values() {
                    link.set_discover(false);
                }
                true
            }
            HEALTH_REPORT_COMMAND => {
                for (slot, link) in &self.maps.read().await.devices {
                    info!(%slot, connected = !link.last_error(), "Health report");
                }
                true
            }
            _ => false,
        }
    }

    /// Every currently registered device link.
    pub async fn links(&self) -> Vec<LinkHandle> {
        self.maps.read().await.devices.values().cloned().collect()
    }

    /// The device link serving `slot`, if one is registered.
    pub async fn link(&self, slot: Slot) -> Option<LinkHandle> {
        self.maps.read().await.devices.get(&slot).cloned()
    }
}
