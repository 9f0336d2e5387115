//! Control payloads carried on channel 0.
//!
//! Channel lifecycle (open, accept, reject, close), liveness beacons,
//! and the version exchange performed at session start.

use bytes::Bytes;

use crate::frame::MAX_NAME_LEN;
use crate::map::{self, MapBuilder};
use crate::WireError;

const OP_OPEN: u64 = 0;
const OP_ACCEPT: u64 = 1;
const OP_REJECT: u64 = 2;
const OP_CLOSE: u64 = 3;
const OP_BEACON: u64 = 4;
const OP_BEACON_ACK: u64 = 5;
const OP_VERSION: u64 = 6;

/// Control payload on the reserved channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Request to open a named channel
    Open {
        /// Channel id picked by the opener
        channel: u16,
        /// Channel name, UTF-8, at most 255 bytes
        name: String,
    },
    /// Open accepted; data frames may now flow
    Accept {
        /// Channel id from the open request
        channel: u16,
    },
    /// Open declined by the remote policy
    Reject {
        /// Channel id from the open request
        channel: u16,
    },
    /// Channel closed by either side
    Close {
        /// Channel id being closed
        channel: u16,
    },
    /// Liveness probe
    Beacon,
    /// Liveness probe reply
    BeaconAck,
    /// Protocol version announcement at session start
    Version {
        /// Announced protocol version
        version: u32,
    },
}

impl ControlMsg {
    /// Encode the control payload as a CBOR map
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let builder = match self {
            ControlMsg::Open { channel, name } => {
                if name.len() > MAX_NAME_LEN {
                    return Err(WireError::Name(name.len()));
                }
                MapBuilder::new()
                    .insert_u64("op", OP_OPEN)
                    .insert_u64("ch", *channel as u64)
                    .insert_str("name", name)
            }
            ControlMsg::Accept { channel } => MapBuilder::new()
                .insert_u64("op", OP_ACCEPT)
                .insert_u64("ch", *channel as u64),
            ControlMsg::Reject { channel } => MapBuilder::new()
                .insert_u64("op", OP_REJECT)
                .insert_u64("ch", *channel as u64),
            ControlMsg::Close { channel } => MapBuilder::new()
                .insert_u64("op", OP_CLOSE)
                .insert_u64("ch", *channel as u64),
            ControlMsg::Beacon => MapBuilder::new().insert_u64("op", OP_BEACON),
            ControlMsg::BeaconAck => MapBuilder::new().insert_u64("op", OP_BEACON_ACK),
            ControlMsg::Version { version } => MapBuilder::new()
                .insert_u64("op", OP_VERSION)
                .insert_u64("v", *version as u64),
        };
        builder.build()
    }

    /// Decode a control payload.
    ///
    /// An unknown op yields `WireError::Op`; the caller decides whether
    /// that is fatal from the carrying frame's critical flag.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let parsed = map::parse_map(raw)?;
        let op = map::get_u64(&parsed, "op").ok_or(WireError::Malformed)?;

        let channel = || -> Result<u16, WireError> {
            map::get_u64(&parsed, "ch")
                .and_then(|c| u16::try_from(c).ok())
                .ok_or(WireError::Malformed)
        };

        match op {
            OP_OPEN => {
                let name = map::get_str(&parsed, "name").ok_or(WireError::Malformed)?;
                if name.len() > MAX_NAME_LEN {
                    return Err(WireError::Name(name.len()));
                }
                Ok(ControlMsg::Open {
                    channel: channel()?,
                    name,
                })
            }
            OP_ACCEPT => Ok(ControlMsg::Accept { channel: channel()? }),
            OP_REJECT => Ok(ControlMsg::Reject { channel: channel()? }),
            OP_CLOSE => Ok(ControlMsg::Close { channel: channel()? }),
            OP_BEACON => Ok(ControlMsg::Beacon),
            OP_BEACON_ACK => Ok(ControlMsg::BeaconAck),
            OP_VERSION => {
                let version = map::get_u64(&parsed, "v")
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(WireError::Malformed)?;
                Ok(ControlMsg::Version { version })
            }
            other => Err(WireError::Op(other.min(u8::MAX as u64) as u8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let msgs = [
            ControlMsg::Open {
                channel: 3,
                name: "git".to_string(),
            },
            ControlMsg::Accept { channel: 3 },
            ControlMsg::Reject { channel: 5 },
            ControlMsg::Close { channel: 3 },
            ControlMsg::Beacon,
            ControlMsg::BeaconAck,
            ControlMsg::Version { version: 1 },
        ];

        for msg in msgs {
            let encoded = msg.encode().unwrap();
            let decoded = ControlMsg::decode(&encoded).unwrap();
            assert_eq!(msg, decoded);
        }
    }

    #[test]
    fn test_unknown_op() {
        let raw = MapBuilder::new().insert_u64("op", 99).build().unwrap();
        assert!(matches!(ControlMsg::decode(&raw), Err(WireError::Op(99))));
    }

    #[test]
    fn test_open_name_too_long() {
        let msg = ControlMsg::Open {
            channel: 1,
            name: "n".repeat(MAX_NAME_LEN + 1),
        };
        assert!(matches!(msg.encode(), Err(WireError::Name(_))));
    }

    #[test]
    fn test_open_without_name_is_malformed() {
        let raw = MapBuilder::new()
            .insert_u64("op", 0)
            .insert_u64("ch", 1)
            .build()
            .unwrap();
        assert!(matches!(
            ControlMsg::decode(&raw),
            Err(WireError::Malformed)
        ));
    }
}
