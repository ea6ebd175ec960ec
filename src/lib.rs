#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// Device mapping entries, slot ids and serial line parameters.
pub mod device;

/// Possible errors in this library.
pub mod error;

/// Handles incoming websocket clients.
pub(crate) mod gateway;

/// Health snapshot of the rack.
pub mod health;

/// The HTTP control plane.
pub(crate) mod http;

/// One supervised serial connection per mapped device.
pub mod link;

/// Logging/tracing setup.
pub mod logging;

/// Reads, edits and persists the device mapping document.
pub mod mapping;

/// The slot router: which device serves a slot, which clients observe it.
pub mod router;

/// Code relating to setting up the server which sets up connections and spawns handlers for clients.
pub mod server;

/// Management-port client for remote power strips.
pub(crate) mod strip;

/// Owns the set of device link workers for the current mapping.
pub mod supervisor;

/// Per-device rolling trace files.
pub(crate) mod trace_log;

pub use error::Error;
