//! ICE session handle for tether.
//!
//! Wraps a NAT-traversal engine behind the `IceEngine` contract:
//! gather candidates, exchange session descriptions through the DHT
//! rendezvous, run connectivity checks, then expose a reliable stream
//! (consumed by the TLS layer) and a lossy datagram surface.
//!
//! Two engines ship in-tree: `HostEngine` over plain TCP/UDP host
//! candidates, and `MemoryEngine` pairing sessions in-process for
//! tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod description;
pub mod engine;
pub mod error;
pub mod memory;
pub mod options;
pub mod session;

// Re-export main types
pub use description::{Candidate, IceDescription};
pub use engine::{
    default_route_ip, DatagramHalf, EngineSession, HostEngine, IceConduit, IceEngine, IceStream,
    MAX_DATAGRAM,
};
pub use error::IceError;
pub use memory::{MemoryEngine, MemoryIceBus};
pub use options::{AddressCache, IceOptions, IceRole, TurnServer};
pub use session::{Component, IceSession, IceState, NegotiationStatus};
