//! Relay Broker Server.
//!
//! Accepts inbound WebSocket connections, authenticates listener
//! registrations by public-key challenge, parks authenticated connections in
//! a per-public-key [`pool::SparePool`], keeps them warm with ping/pong, and
//! splices an incoming `communication_request` to the top spare for its
//! target public key.

pub mod pool;
pub mod server;

pub use server::{BrokerError, RelayBroker};
