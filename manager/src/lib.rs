//! Connection manager for tether.
//!
//! Orchestrates the full pipeline from a `connect_device` call to a
//! vended channel: DHT rendezvous offer/answer, ICE negotiation, a
//! pinned mutual-TLS handshake, and the multiplexed socket carrying
//! named channels. Concurrent attempts to the same device are
//! deduplicated, simultaneous connects are arbitrated with a
//! deterministic tie-break, and every registered waiter resolves
//! exactly once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dht;
pub mod manager;
mod pending;

// Re-export main types
pub use config::{ManagerConfig, Timeouts, UpnpController};
pub use dht::{DhtError, DhtRunner, ListenToken, MemoryDht, MemoryDhtBus};
pub use manager::{
    ChannelRequestHook, ConnectCallback, ConnectOpts, ConnectionManager, ConnectionReadyHook,
    IceRequestHook, IosConnectedHook,
};

// Companion-layer types a host needs alongside the manager
pub use tether_ice::{HostEngine, IceEngine, MemoryEngine, MemoryIceBus, TurnServer};
pub use tether_session::{
    AllowAllStore, CertificateStore, ChannelSocket, DeviceIdentity, Error, MuxConfig,
};
pub use tether_wire::DeviceId;
