//! ICE error types.

use thiserror::Error;

/// ICE session and engine errors
#[derive(Error, Debug)]
pub enum IceError {
    /// Operation requires a completed `initialize()`
    #[error("session not initialized")]
    NotInitialized,

    /// Operation invalid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Candidate gathering failed
    #[error("candidate gathering failed: {0}")]
    GatherFailed(String),

    /// Connectivity checks exhausted every candidate pair
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Negotiation deadline elapsed
    #[error("negotiation timed out")]
    Timeout,

    /// Session shut down; no further I/O possible
    #[error("session closed")]
    Closed,

    /// No datagram currently available
    #[error("would block")]
    WouldBlock,

    /// Datagram exceeds the component MTU
    #[error("datagram too large: {0}")]
    TooLarge(usize),

    /// Session description could not be parsed
    #[error("bad session description: {0}")]
    Description(String),

    /// Underlying socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
