//! Connection-level error kinds.
//!
//! Every terminal failure in the stack maps onto one of these kinds;
//! callbacks receive exactly one of a channel or an error of this type.

/// Terminal error kinds surfaced to waiters and callbacks
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Request rejected at the API or codec boundary
    #[error("malformed request")]
    Malformed,

    /// The DHT cannot take new publishes or listens
    #[error("dht unavailable")]
    DhtUnavailable,

    /// A stage deadline elapsed
    #[error("timed out")]
    Timeout,

    /// The remote policy declined the channel
    #[error("peer refused")]
    PeerRefused,

    /// ICE candidate gathering failed
    #[error("ice gathering failed")]
    IceGatherFailed,

    /// ICE connectivity checks exhausted every pair
    #[error("ice negotiation failed")]
    IceNegotiationFailed,

    /// TLS handshake did not complete
    #[error("tls handshake failed")]
    TlsHandshakeFailed,

    /// Remote certificate does not match the expected identity
    #[error("peer identity mismatch")]
    PeerIdentity,

    /// Framing violation; fatal for the owning connection
    #[error("protocol error")]
    ProtocolError,

    /// Channel or connection closed
    #[error("channel closed")]
    ChannelClosed,

    /// Three consecutive beacon acks missed
    #[error("peer unreachable")]
    PeerUnreachable,

    /// Owning scope was torn down while the operation was in flight
    #[error("cancelled")]
    Cancelled,

    /// No socket available and none may be negotiated
    #[error("no socket")]
    NoSocket,

    /// Connection lost the simultaneous-connect tie-break
    #[error("duplicate connection")]
    Duplicate,
}

impl From<tether_wire::WireError> for Error {
    fn from(e: tether_wire::WireError) -> Self {
        match e {
            tether_wire::WireError::Size(_)
            | tether_wire::WireError::Varint
            | tether_wire::WireError::Op(_) => Error::ProtocolError,
            _ => Error::Malformed,
        }
    }
}

impl From<tether_ice::IceError> for Error {
    fn from(e: tether_ice::IceError) -> Self {
        match e {
            tether_ice::IceError::GatherFailed(_) => Error::IceGatherFailed,
            tether_ice::IceError::Timeout => Error::Timeout,
            tether_ice::IceError::Closed => Error::Cancelled,
            _ => Error::IceNegotiationFailed,
        }
    }
}
