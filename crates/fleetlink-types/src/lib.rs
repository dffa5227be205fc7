//! Core types for FleetLink, the Unified Wire Bridge Protocol (U-WBP) runtime.
//!
//! This crate defines the data structures shared by the wire runtime, the
//! security gate and the hub daemon. It contains no I/O and no business logic.

pub mod capability;
pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod message;
