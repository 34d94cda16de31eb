//! Relay wire protocol
//!
//! Defines the role vocabulary, the static routing table, and the payload
//! classification used by the device endpoint. The wire itself is unframed
//! raw TCP; one read yields one logical message.

mod classify;
mod wire;

pub use classify::*;
pub use wire::*;
