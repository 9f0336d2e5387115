//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete frame (need more data)
    #[error("incomplete frame")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Required field missing or field has the wrong shape
    #[error("malformed value")]
    Malformed,

    /// Invalid CBOR map
    #[error("cbor map invalid")]
    Meta,

    /// Channel name longer than 255 bytes
    #[error("channel name too long: {0}")]
    Name(usize),

    /// Unknown control op
    #[error("unknown op {0}")]
    Op(u8),

    /// Varint longer than 10 bytes or overflowing u64
    #[error("varint overflow")]
    Varint,
}
