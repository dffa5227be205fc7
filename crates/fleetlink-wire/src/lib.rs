//! FleetLink wire runtime: the Unified Wire Bridge Protocol (U-WBP) core.
//!
//! Links independently hosted game servers to one management hub.
//!
//! ## Architecture
//!
//! - **codec**: envelope encode/decode plus newline framing for stream transports
//! - **adapter**: one `ConnectionAdapter` trait over four transports
//! - **reconnect**: exponential backoff with a hard ceiling and an attempt cap
//! - **subscription**: per-peer event interest with attribute filters
//! - **command_queue**: per-peer FIFO lane, one command in flight
//! - **bridge**: binds adapter, reconnection and subscriptions to one peer
//! - **scheduler**: the submit/submit-delayed port timers go through

pub mod adapter;
pub mod bridge;
pub mod codec;
pub mod command_queue;
pub mod pending;
pub mod reconnect;
pub mod scheduler;
pub mod subscription;

pub use adapter::{AdapterContext, AdapterEvent, ConnectionAdapter, ConnectionState};
pub use bridge::{Bridge, BridgeEvent, BridgeOptions, BridgeSnapshot, ConnectionStatus, EventSink};
pub use codec::{DecodeError, FrameBuffer};
pub use reconnect::{ReconnectEvent, ReconnectStatus, ReconnectionManager};
pub use scheduler::{Scheduler, TaskHandle, TokioScheduler};
pub use subscription::SubscriptionRegistry;
