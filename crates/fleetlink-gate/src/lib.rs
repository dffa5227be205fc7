//! Security gate for the FleetLink hub.
//!
//! Sits in front of every externally reachable entry point (HTTP API and the
//! inbound peer socket) and decides, per request, whether to admit it:
//!
//! - **limiter**: sliding-window request budget per identity
//! - **scorer**: suspicion score over a short window, with decaying flags
//! - **emergency**: process-wide breaker driven by aggregate volume
//! - **headers**: hardening and rate-limit headers attached to every response
//! - **middleware**: the axum layer that runs the gate

pub mod emergency;
pub mod gate;
pub mod headers;
pub mod limiter;
pub mod middleware;
pub mod scorer;

pub use gate::{
    status_for_reason, DenyCode, Denial, GateDecision, GateSnapshot, IdentitySnapshot,
    SecurityGate,
};
pub use middleware::{security_gate, UserId};
