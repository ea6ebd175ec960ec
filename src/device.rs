use std::fmt::Display;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The logical address of a device: a slot number plus a component index.
///
/// Most slots host a single device (component 0). A slot may also host
/// several components, e.g. a unit with more than one serial trace port;
/// those are numbered from 1.
///
/// The canonical form is twelve hex digits: the component index folded into
/// the higher digits, the slot number in the lower digits. Component 0 is
/// all-zero padding, so plain slot 5 reads `000000000005`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slot {
    number: u16,
    component: u8,
}

impl Slot {
    /// Slot numbers must fit in the three hex digits of the encoding.
    pub const MAX_NUMBER: u16 = 0xFFF;

    /// Component indices occupy a single decimal digit of the encoding.
    pub const MAX_COMPONENT: u8 = 9;

    /// A new slot address. Fails if either part overflows its digits.
    pub fn new(number: u16, component: u8) -> Result<Self, Error> {
        if number > Self::MAX_NUMBER {
            return Err(Error::MappingValidation(format!(
                "Slot number {number} does not fit in three hex digits"
            )));
        }
        if component > Self::MAX_COMPONENT {
            return Err(Error::MappingValidation(format!(
                "Component index {component} does not fit in one digit"
            )));
        }
        Ok(Self { number, component })
    }

    /// The slot number part.
    pub fn number(&self) -> u16 {
        self.number
    }

    /// The component index part. 0 for single-device slots.
    pub fn component(&self) -> u8 {
        self.component
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.component == 0 {
            write!(f, "{:012X}", self.number)
        } else {
            write!(f, "0000000{}{:04X}", self.component, self.number)
        }
    }
}

impl FromStr for Slot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::MappingValidation(format!("`{s}` is not a valid slot id"));

        let bytes = s.as_bytes();
        if bytes.len() != 12 || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(malformed());
        }

        // The seven leading digits and the one between the component digit
        // and the slot number carry no information and must be zero.
        if !s[..7].bytes().all(|b| b == b'0') || &s[8..9] != "0" {
            return Err(malformed());
        }

        let component = s[7..8].parse::<u8>().map_err(|_| malformed())?;
        let number = u16::from_str_radix(&s[9..12], 16).map_err(|_| malformed())?;

        Self::new(number, component)
    }
}

impl TryFrom<String> for Slot {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Slot> for String {
    fn from(slot: Slot) -> Self {
        slot.to_string()
    }
}

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    /// No parity bit.
    #[default]
    #[serde(alias = "N")]
    None,

    /// Odd parity.
    #[serde(alias = "O")]
    Odd,

    /// Even parity.
    #[serde(alias = "E")]
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// How a device is physically attached.
///
/// Only the port path is mandatory. Any line parameter left out falls back
/// to the device type's defaults, then to 115200 8-N-1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProperties {
    /// The serial port path, e.g. `/dev/ttyO105`.
    pub port: String,

    /// Baud rate override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud: Option<u32>,

    /// Parity override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity: Option<Parity>,

    /// Data bits override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_bits: Option<u8>,

    /// Stop bits override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_bits: Option<u8>,
}

impl ConnectionProperties {
    /// Properties with just a port path; all line parameters defaulted.
    pub fn new(port: &str) -> Self {
        Self {
            port: port.into(),
            baud: None,
            parity: None,
            data_bits: None,
            stop_bits: None,
        }
    }
}

/// One entry of the device mapping document.
///
/// Immutable once constructed; mapping edits replace whole entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    /// The slot this device serves.
    pub id: Slot,

    /// Device type, e.g. `"DTA"`. Selects a row of line parameter defaults.
    #[serde(rename = "type")]
    pub device_type: String,

    /// Physical attachment.
    pub connection_properties: ConnectionProperties,
}

/// Effective serial line parameters for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate.
    pub baud: u32,

    /// Parity.
    pub parity: Parity,

    /// Data bits (5-8).
    pub data_bits: u8,

    /// Stop bits (1-2).
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    /// Defaults for a device type.
    ///
    /// Legacy trace adapters (`"DTA"`) run the stock 115200 8-N-1; unknown
    /// types fall through to the same global default.
    pub fn for_device_type(device_type: &str) -> Self {
        match device_type {
            "DTA" => Self::default(),
            _ => Self::default(),
        }
    }

    /// Resolve the effective parameters for an entry: explicit per-device
    /// properties win over the device type defaults, which win over the
    /// global default.
    pub fn resolve(entry: &DeviceEntry) -> Self {
        let type_defaults = Self::for_device_type(&entry.device_type);
        let props = &entry.connection_properties;

        Self {
            baud: props.baud.unwrap_or(type_defaults.baud),
            parity: props.parity.unwrap_or(type_defaults.parity),
            data_bits: props.data_bits.unwrap_or(type_defaults.data_bits),
            stop_bits: props.stop_bits.unwrap_or(type_defaults.stop_bits),
        }
    }
}

/// The device mapping document: every serial device the service bridges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMapping {
    /// The mapped devices, in document order.
    pub devices: Vec<DeviceEntry>,

    /// Rack flavor discriminator. `"UART"` means devices are wired
    /// directly; anything else means ports are fronted by managed
    /// power strips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

impl DeviceMapping {
    /// An example mapping document with some fields filled in.
    pub fn example() -> Self {
        let slot = |number, component| Slot::new(number, component).expect("Example slots are valid");

        Self {
            devices: vec![
                DeviceEntry {
                    id: slot(5, 0),
                    device_type: "DTA".into(),
                    connection_properties: ConnectionProperties {
                        baud: Some(9600),
                        ..ConnectionProperties::new("/dev/ttyO001")
                    },
                },
                DeviceEntry {
                    id: slot(16, 0),
                    device_type: "DTA".into(),
                    connection_properties: ConnectionProperties::new("/dev/ttyO002"),
                },
                DeviceEntry {
                    id: slot(16, 1),
                    device_type: "DTA".into(),
                    connection_properties: ConnectionProperties::new("/dev/ttyO003"),
                },
            ],
            device_type: Some("UART".into()),
        }
    }

    /// Whether the rack is plain UART (no power strips to manage).
    pub fn is_uart_only(&self) -> bool {
        matches!(self.device_type.as_deref(), Some("UART"))
    }

    /// Look up the device entry serving a slot.
    pub fn get(&self, slot: Slot) -> Option<&DeviceEntry> {
        self.devices.iter().find(|device| device.id == slot)
    }

    /// Whether any device serves the slot.
    pub fn contains(&self, slot: Slot) -> bool {
        self.get(slot).is_some()
    }

    /// Mapping documents must not map the same slot twice.
    pub fn validate(&self) -> Result<(), Error> {
        let duplicates = self
            .devices
            .iter()
            .map(|device| device.id)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::MappingValidation(format!(
                "These slots are mapped more than once: {}",
                duplicates.iter().join(", ")
            )))
        }
    }
}
