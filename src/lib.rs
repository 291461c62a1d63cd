//! Connection-brokering and end-to-end encrypted transport core for a
//! peer-to-peer data-exchange platform.
//!
//! Three layers, leaves first:
//!
//! - [`transport`] + [`ws`] — the Framed Duplex Channel and its underlying
//!   WebSocket/queue primitives.
//! - [`codec`] + [`crypto`] — the broker wire protocol and the end-to-end
//!   encrypted channel (ephemeral key exchange, parity-counter nonces).
//! - [`broker`], [`listener`], [`oce`], [`icm`] — the rendezvous server, its
//!   peer-side counterpart, the outbound dialer, and the unified accept
//!   side an application actually embeds.
//!
//! Applications supply a long-term [`crypto::keys::IdentityKeyPair`] per
//! identity and consume [`icm::AcceptedConnection`]s; everything upstream of
//! that (profiles, storage, sync) is out of scope for this crate.

pub mod broker;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod icm;
pub mod ids;
pub mod listener;
pub mod oce;
pub mod transport;
pub mod ws;
