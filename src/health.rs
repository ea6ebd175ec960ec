use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tracing::warn;

use crate::device::{DeviceEntry, SerialSettings};
use crate::mapping::MappingStore;
use crate::router::Router;
use crate::strip::StripFleet;

/// One probed entity: a serial port, or a power strip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// What was probed, e.g. a port path or `"Power strip"`.
    pub entity: String,

    /// The slot id or strip number the entity belongs to.
    pub device_id: String,

    /// Whether the entity looked reachable.
    pub is_healthy: bool,

    /// Why not, when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,

    /// The strip's address, for strip entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Extra facts gathered from the entity (uptime, firmware, MAC, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// The whole rack's health at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Service version.
    pub version: String,

    /// False as soon as any serial port is unreachable.
    pub is_healthy: bool,

    /// Summary of what is wrong, when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,

    /// Power strip reports. Empty on plain UART racks.
    pub hw_devices_health_status: Vec<HealthReport>,

    /// Serial port reports, one per mapped device.
    pub dependencies_health_status: Vec<HealthReport>,

    /// When the snapshot was taken.
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Take a health snapshot of the rack.
pub(crate) async fn snapshot(
    router: &Router,
    store: &MappingStore,
    strips: Option<&StripFleet>,
) -> HealthStatus {
    let mapping = store.snapshot();

    let mut dependencies = Vec::with_capacity(mapping.devices.len());
    for device in &mapping.devices {
        dependencies.push(port_health(router, device).await);
    }

    let hw_devices = match strips {
        Some(fleet) => fleet.health().await,
        None => Vec::new(),
    };

    let is_healthy = dependencies.iter().all(|report| report.is_healthy);

    HealthStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        is_healthy,
        remarks: (!is_healthy).then(|| "Serial ports are unhealthy".to_string()),
        hw_devices_health_status: hw_devices,
        dependencies_health_status: dependencies,
        generated_at: chrono::Utc::now(),
    }
}

/// Reachability of one device's port.
///
/// A slot whose link currently holds the port open is healthy by
/// definition; probing it would just contend with our own worker. Anything
/// else gets a short open attempt.
async fn port_health(router: &Router, device: &DeviceEntry) -> HealthReport {
    let port = device.connection_properties.port.clone();

    let mut report = HealthReport {
        entity: port.clone(),
        device_id: device.id.to_string(),
        is_healthy: false,
        remarks: None,
        host: None,
        metadata: None,
    };

    if let Some(link) = router.link(device.id).await {
        if link.is_open() {
            report.is_healthy = true;
            return report;
        }
    }

    let baud = SerialSettings::resolve(device).baud;

    let probe = spawn_blocking(move || {
        serialport::new(&port, baud)
            .timeout(Duration::from_secs(1))
            .open()
            .map(drop)
    })
    .await;

    match probe {
        Ok(Ok(())) => report.is_healthy = true,
        Ok(Err(e)) => report.remarks = Some(e.to_string()),
        Err(e) => {
            warn!("Port probe task failed: {e}");
            report.remarks = Some(e.to_string());
        }
    }

    report
}
