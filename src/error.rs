use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// No device is currently mapped to the slot.
    #[error("No device is mapped to slot `{0}`")]
    UnknownSlot(String),

    /// A payload which should have been hex text was not.
    #[error("Payload is not valid hex: {0}")]
    InvalidEncoding(String),

    /// Bytes read off the wire could not be decoded as text.
    #[error("Serial output could not be decoded as text: {0}")]
    Decode(String),

    /// Opening, reading or writing a device port failed.
    #[error("Device I/O failure: {0}")]
    DeviceIo(String),

    /// A mapping document or slot mapping edit did not validate.
    #[error("Invalid slot mapping: {0}")]
    MappingValidation(String),

    /// The configuration file did not validate.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Underlying I/O problem, e.g. on the mapping document.
    #[error("I/O problem")]
    Io(#[from] std::io::Error),
}
