//! FleetLink hub daemon.
//!
//! Wires configured peers into [`fleetlink_wire::Bridge`]s, puts the
//! [`fleetlink_gate::SecurityGate`] in front of the HTTP surface, and accepts
//! inbound peer sockets on `/wbp/connect`.

pub mod config;
pub mod hub;
pub mod server;

pub use hub::{HealthReport, Hub};
