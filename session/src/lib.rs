//! Authenticated session layer for tether: TLS over the negotiated
//! ICE stream, and the multiplexed channel socket on top of it.
//!
//! The initiator runs the TLS client role and pins the expected device
//! id; the responder runs the server role and defers chain validation
//! to the certificate store capability. The multiplexed socket then
//! carries any number of named channels over the one stream, with
//! per-channel flow control and beacon-based liveness.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod identity;
pub mod mux;
pub mod tls;

// Re-export main types
pub use channel::ChannelSocket;
pub use error::Error;
pub use identity::{device_id_from_cert, peer_uri_from_cert, DeviceIdentity, DEVICE_URI_PREFIX};
pub use mux::{
    ChannelOpenedHook, ChannelRequestHook, MultiplexedSocket, MuxConfig, MuxHooks, PendingOpen,
    SocketClosedHook, SocketIdleHook, MUX_PROTOCOL_VERSION,
};
pub use tls::{
    accept_tls, connect_tls, AllowAllStore, CertificateStore, TlsSession, TlsStream, ALPN,
};
