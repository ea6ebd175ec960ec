use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::device::{ConnectionProperties, DeviceEntry, DeviceMapping, Slot};
use crate::error::Error;

/// The device type assigned to entries produced by slot mapping edits.
const MAPPED_DEVICE_TYPE: &str = "DTA";

/// A slot's mapping in edit requests: either one spec string, or a list of
/// them for slots hosting several components.
///
/// A spec string reads `"<deviceIndex>:<outlet>[:<baud>]"` with 1-based
/// decimal fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotSpec {
    /// A single-component slot.
    One(String),

    /// A multi-component slot; list order assigns component indices 1, 2, ..
    Many(Vec<String>),
}

impl SlotSpec {
    fn specs(&self) -> &[String] {
        match self {
            SlotSpec::One(spec) => std::slice::from_ref(spec),
            SlotSpec::Many(specs) => specs,
        }
    }
}

/// A full mapping replacement request.
///
/// Either a table of slot number → spec, or a complete mapping document in
/// the on-disk format.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MappingRequest {
    /// Per-slot spec strings.
    Slots {
        /// Keys are decimal slot numbers.
        slots: BTreeMap<String, SlotSpec>,
    },

    /// A raw device mapping document.
    Document(DeviceMapping),
}

/// Owns the on-disk device mapping document and the current in-memory
/// snapshot of it.
///
/// Snapshots are handed out as `Arc`s and swapped whole, so a reader holds
/// a consistent mapping for as long as it keeps the `Arc` and never sees a
/// half-applied edit.
pub struct MappingStore {
    path: PathBuf,
    current: RwLock<Arc<DeviceMapping>>,
}

impl MappingStore {
    /// Load the mapping document at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mapping = read_document(&path)?;

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(mapping)),
        })
    }

    /// The current mapping snapshot.
    pub fn snapshot(&self) -> Arc<DeviceMapping> {
        self.current.read().expect("Mapping lock poisoned").clone()
    }

    /// Replace the whole mapping from an edit request, persist it, and make
    /// it the current snapshot.
    pub fn apply_full(&self, request: MappingRequest) -> Result<Arc<DeviceMapping>, Error> {
        let mapping = match request {
            MappingRequest::Slots { slots } => {
                let mut devices = Vec::new();

                for (slot, spec) in &slots {
                    let number = parse_slot_number(slot)?;
                    devices.extend(entries_for_slot(number, spec)?);
                }

                DeviceMapping {
                    devices,
                    device_type: self.snapshot().device_type.clone(),
                }
            }
            MappingRequest::Document(document) => document,
        };

        self.commit(mapping)
    }

    /// Replace one slot's mapping, persist, and swap the snapshot.
    ///
    /// All existing components of the slot are dropped first; `spec` then
    /// contributes the new ones.
    pub fn apply_slot(&self, slot: &str, spec: SlotSpec) -> Result<Arc<DeviceMapping>, Error> {
        let number = parse_slot_number(slot)?;

        // Validate before touching the document so a bad edit leaves the
        // mapping unchanged.
        let replacements = entries_for_slot(number, &spec)?;

        let mut mapping = (*self.snapshot()).clone();
        mapping.devices.retain(|device| device.id.number() != number);
        mapping.devices.extend(replacements);

        self.commit(mapping)
    }

    /// Remove every component mapped under the slot, persist, and swap the
    /// snapshot.
    pub fn delete_slot(&self, slot: &str) -> Result<Arc<DeviceMapping>, Error> {
        let number = parse_slot_number(slot)?;

        let mut mapping = (*self.snapshot()).clone();
        mapping.devices.retain(|device| device.id.number() != number);

        self.commit(mapping)
    }

    fn commit(&self, mapping: DeviceMapping) -> Result<Arc<DeviceMapping>, Error> {
        mapping.validate()?;

        let serialized =
            serde_json::to_string_pretty(&mapping).expect("Mapping documents serialize");
        std::fs::write(&self.path, serialized)?;

        let mapping = Arc::new(mapping);
        *self.current.write().expect("Mapping lock poisoned") = mapping.clone();

        info!(devices = mapping.devices.len(), "Mapping updated");

        Ok(mapping)
    }
}

fn read_document(path: &Path) -> Result<DeviceMapping, Error> {
    let contents = std::fs::read_to_string(path)?;

    let mapping: DeviceMapping = serde_json::from_str(&contents)
        .map_err(|e| Error::MappingValidation(format!("Mapping document does not parse: {e}")))?;
    mapping.validate()?;

    Ok(mapping)
}

fn parse_slot_number(slot: &str) -> Result<u16, Error> {
    let number = slot
        .parse::<u16>()
        .map_err(|_| Error::MappingValidation(format!("`{slot}` is not a slot number")))?;

    if number > Slot::MAX_NUMBER {
        return Err(Error::MappingValidation(format!(
            "Slot number {number} is out of range"
        )));
    }

    Ok(number)
}

fn entries_for_slot(number: u16, spec: &SlotSpec) -> Result<Vec<DeviceEntry>, Error> {
    spec.specs()
        .iter()
        .enumerate()
        .map(|(index, spec)| parse_spec(number, spec, index as u8))
        .collect()
}

/// Parse one `"<deviceIndex>:<outlet>[:<baud>]"` spec into a device entry.
///
/// Device index and outlet are 1-based; outlet 0 is reserved on the strips,
/// so a standalone `0` in either field is rejected. The derived port path
/// uses the 0-based form of both.
fn parse_spec(number: u16, spec: &str, component: u8) -> Result<DeviceEntry, Error> {
    if spec == "N/A" {
        return Err(Error::MappingValidation(format!(
            "Slot {number}: `N/A` is not a mapping; leave the slot out instead"
        )));
    }

    let bad = |what: &str| Error::MappingValidation(format!("Slot {number} spec `{spec}`: {what}"));

    let mut fields = spec.split(':');

    let device_index = fields.next().ok_or_else(|| bad("missing device index"))?;
    let outlet = fields.next().ok_or_else(|| bad("missing outlet"))?;
    let baud = fields.next();

    if fields.next().is_some() {
        return Err(bad("too many fields"));
    }

    let device_index = parse_one_based(device_index).ok_or_else(|| {
        bad("device index must be a 1-based number; strip numbering starts at 1")
    })?;
    let outlet = parse_one_based(outlet)
        .ok_or_else(|| bad("outlet must be a 1-based number; outlet 0 is reserved"))?;

    let baud = match baud {
        Some(field) if field.trim().is_empty() => {
            return Err(bad("baud may not be blank"));
        }
        Some(field) => Some(
            field
                .parse::<u32>()
                .map_err(|_| bad("baud must be an integer"))?,
        ),
        None => None,
    };

    let port = format!("/dev/ttyO{}{:02}", device_index - 1, outlet - 1);

    Ok(DeviceEntry {
        id: Slot::new(number, component)?,
        device_type: MAPPED_DEVICE_TYPE.into(),
        connection_properties: ConnectionProperties {
            baud,
            ..ConnectionProperties::new(&port)
        },
    })
}

fn parse_one_based(field: &str) -> Option<u32> {
    match field.parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(value) => Some(value),
    }
}
