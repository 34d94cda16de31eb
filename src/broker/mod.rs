//! Relay broker: role registry, routing, and the TCP accept/relay loop

mod registry;
mod relay;

pub use registry::{ConnectionRegistry, PeerHandle, Registration};
pub use relay::{Broker, BrokerConfig, BrokerHandle};
