//! Resilient broker endpoint and its named-pipe bridge

mod bridge;
mod client;

pub use bridge::{BridgeConfig, CachedReport, PipeBridge};
pub use client::{Endpoint, EndpointConfig, EndpointEvent, EndpointHandle, EndpointState};
