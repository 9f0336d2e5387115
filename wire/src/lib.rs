//! Wire formats for tether: mux framing, control ops, and the DHT
//! rendezvous codec.
//!
//! Everything on the wire is a CBOR map behind a small length prefix:
//! mux frames are `uvarint length | {c, d, [n], [f]}` on the
//! authenticated stream, control payloads ride channel 0, and
//! rendezvous requests are encrypted CBOR maps published on the DHT.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | uvarint frame_len    | length of the CBOR map     |
//! +----------------------+----------------------------+
//! | c: u16               | channel id (0 = control)   |
//! | d: bytes             | payload                    |
//! | n: str (opt)         | channel name on open       |
//! | f: u8 (opt)          | flag bitfield              |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod error;
pub mod frame;
pub mod identity;
pub mod map;
pub mod rendezvous;
pub mod varint;

// Re-export main types
pub use control::ControlMsg;
pub use error::WireError;
pub use frame::{
    Frame, FrameDecoder, CONTROL_CHANNEL, FLAG_CRITICAL, MAX_DATA_LEN, MAX_FRAME_LEN, MAX_NAME_LEN,
};
pub use identity::{DeviceId, DEVICE_ID_LEN};
pub use map::{get_bool, get_bytes, get_str, get_u64, parse_map, MapBuilder};
pub use rendezvous::{listen_key, PeerConnectionRequest, KEY_PREFIX, MAX_FIELD_LEN};
pub use varint::{get_uvarint, put_uvarint};
