//! Mux frame codec.
//!
//! Each frame on the authenticated stream is a uvarint length prefix
//! followed by a CBOR map with short keys: `c` (channel, u16), `d`
//! (data, bytes), optionally `n` (name, str) and `f` (flags, u8).
//! Channel 0 is reserved for control payloads.

use bytes::{Buf, Bytes, BytesMut};

use crate::map::{self, MapBuilder};
use crate::varint::{get_uvarint, put_uvarint};
use crate::WireError;

/// Reserved channel id carrying control payloads
pub const CONTROL_CHANNEL: u16 = 0;

/// Largest data payload carried by a single frame
pub const MAX_DATA_LEN: usize = 64 * 1024;

/// Largest accepted channel name
pub const MAX_NAME_LEN: usize = 255;

/// Hard cap on one encoded frame; anything larger is a protocol error
pub const MAX_FRAME_LEN: usize = 128 * 1024;

/// Frame flag: the receiver must understand this frame or tear down
pub const FLAG_CRITICAL: u8 = 0x01;

/// One mux frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel id; 0 is the control channel
    pub channel: u16,
    /// Frame payload
    pub data: Bytes,
    /// Channel name, present on open frames
    pub name: Option<String>,
    /// Flag bitfield
    pub flags: Option<u8>,
}

impl Frame {
    /// Create a data frame for a channel
    pub fn data(channel: u16, data: Bytes) -> Self {
        Self {
            channel,
            data,
            name: None,
            flags: None,
        }
    }

    /// Create a control frame (channel 0)
    pub fn control(data: Bytes) -> Self {
        Self::data(CONTROL_CHANNEL, data)
    }

    /// Whether this frame carries a control payload
    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }

    /// Whether the critical flag is set
    pub fn is_critical(&self) -> bool {
        self.flags.map(|f| f & FLAG_CRITICAL != 0).unwrap_or(false)
    }

    /// Encode the frame with its uvarint length prefix
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.data.len() > MAX_DATA_LEN {
            return Err(WireError::Size(self.data.len()));
        }
        if let Some(name) = &self.name {
            if name.len() > MAX_NAME_LEN {
                return Err(WireError::Name(name.len()));
            }
        }

        let mut builder = MapBuilder::new()
            .insert_u64("c", self.channel as u64)
            .insert_bytes("d", &self.data);
        if let Some(name) = &self.name {
            builder = builder.insert_str("n", name);
        }
        if let Some(flags) = self.flags {
            builder = builder.insert_u64("f", flags as u64);
        }
        let body = builder.build()?;

        if body.len() > MAX_FRAME_LEN {
            return Err(WireError::Size(body.len()));
        }

        let mut buf = BytesMut::with_capacity(body.len() + 4);
        put_uvarint(&mut buf, body.len() as u64);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }
}

/// Incremental frame decoder over an accumulation buffer
#[derive(Debug, Default)]
pub struct FrameDecoder {
    _priv: (),
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame from the buffer, consuming its bytes.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        let (body_len, prefix_len) = match get_uvarint(buf)? {
            Some(v) => v,
            None => return Ok(None),
        };

        let body_len = body_len as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(WireError::Size(body_len));
        }
        if buf.len() < prefix_len + body_len {
            return Ok(None);
        }

        buf.advance(prefix_len);
        let body = buf.split_to(body_len);

        let parsed = map::parse_map(&body)?;
        let channel = map::get_u64(&parsed, "c")
            .and_then(|c| u16::try_from(c).ok())
            .ok_or(WireError::Malformed)?;
        let data = map::get_bytes(&parsed, "d").ok_or(WireError::Malformed)?;
        if data.len() > MAX_DATA_LEN {
            return Err(WireError::Size(data.len()));
        }
        let name = map::get_str(&parsed, "n");
        if let Some(n) = &name {
            if n.len() > MAX_NAME_LEN {
                return Err(WireError::Name(n.len()));
            }
        }
        let flags = map::get_u64(&parsed, "f").and_then(|f| u8::try_from(f).ok());

        Ok(Some(Frame {
            channel,
            data,
            name,
            flags,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            channel: 7,
            data: Bytes::from_static(b"hello"),
            name: Some("git".to_string()),
            flags: Some(FLAG_CRITICAL),
        };

        let encoded = frame.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
        assert!(decoded.is_critical());
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let frame = Frame::data(3, Bytes::from_static(b"partial delivery"));
        let encoded = frame.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the last byte completes the frame
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let a = Frame::data(1, Bytes::from_static(b"first"));
        let b = Frame::control(Bytes::from_static(b"second"));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode().unwrap());
        buf.extend_from_slice(&b.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), b);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_data_rejected() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX_DATA_LEN + 1]));
        assert!(matches!(frame.encode(), Err(WireError::Size(_))));
    }

    #[test]
    fn test_oversized_name_rejected() {
        let frame = Frame {
            channel: 1,
            data: Bytes::new(),
            name: Some("x".repeat(MAX_NAME_LEN + 1)),
            flags: None,
        };
        assert!(matches!(frame.encode(), Err(WireError::Name(_))));
    }

    #[test]
    fn test_length_overflow_is_fatal() {
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, (MAX_FRAME_LEN + 1) as u64);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(WireError::Size(_))
        ));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let body = crate::map::MapBuilder::new()
            .insert_u64("c", 1)
            .build()
            .unwrap();
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, body.len() as u64);
        buf.extend_from_slice(&body);
        assert!(matches!(
            FrameDecoder::new().decode(&mut buf),
            Err(WireError::Malformed)
        ));
    }
}
