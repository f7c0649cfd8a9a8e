//! Cloud control client for Fossibot/Sydpower portable power stations.
//!
//! The vendor exposes no LAN protocol: every telemetry read and every command
//! goes through a serverless HTTPS login, an MQTT-over-WebSocket session
//! against a broker discovered at runtime, and a Modbus-RTU-framed binary
//! payload on per-device MQTT topics.
//!
//! The [`Coordinator`] is the entry point for upper layers: it owns a
//! [`Connector`] (auth, broker discovery, reconnection), polls the devices on
//! an interval, and exposes the merged per-device attribute maps. Commands
//! are validated against the writable-register allowlist in [`modbus`] before
//! any byte reaches the wire; firmware does not clamp writes, so the
//! allowlist is a hard safety contract rather than a convenience.

pub mod api;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod modbus;
pub mod mqtt;
pub mod signal;

pub use connector::Connector;
pub use coordinator::{Coordinator, DEFAULT_UPDATE_INTERVAL};
pub use error::{Error, Result, ValidationError};
pub use modbus::{AttrValue, Command, DeviceState};
