//! Device identity derived from a long-lived public key.

use std::fmt;
use std::str::FromStr;

use ring::digest;

use crate::WireError;

/// Size of a device id in bytes (SHA-256 output)
pub const DEVICE_ID_LEN: usize = 32;

/// Stable opaque identifier for a device: SHA-256 of its public key DER.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Derive a device id from a public key in DER (SPKI) form
    pub fn from_public_key_der(der: &[u8]) -> Self {
        let print = digest::digest(&digest::SHA256, der);
        let mut bytes = [0u8; DEVICE_ID_LEN];
        bytes.copy_from_slice(print.as_ref());
        Self(bytes)
    }

    /// Build a device id from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != DEVICE_ID_LEN {
            return Err(WireError::Malformed);
        }
        let mut out = [0u8; DEVICE_ID_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Raw id bytes
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }

    /// Shortened hex form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

impl FromStr for DeviceId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::Malformed)?;
        Self::from_bytes(&bytes)
    }
}
