//! Rendezvous request exchanged over the DHT.
//!
//! A `PeerConnectionRequest` asks a device for an initial connection:
//! it carries the ICE session description, a per-offer request id, and
//! whether the value is the answer. Values are encrypted to the
//! recipient by the DHT runner; this codec handles the plaintext map.

use bytes::Bytes;

use crate::identity::DeviceId;
use crate::map::{self, MapBuilder};
use crate::WireError;

/// Prefix of the DHT listen key
pub const KEY_PREFIX: &str = "peer:";

/// Largest accepted ICE blob or connection-type tag
pub const MAX_FIELD_LEN: usize = 64 * 1024;

/// Request for an initial connection, transmitted via the DHT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionRequest {
    /// Request id, unique per offer; never zero
    pub id: u64,
    /// Opaque ICE session description
    pub ice_msg: Bytes,
    /// Whether this value answers a previous offer
    pub is_answer: bool,
    /// Why the connection is opened; used for wake/push semantics
    pub conn_type: String,
}

impl PeerConnectionRequest {
    /// Encode the request as a CBOR map
    pub fn encode(&self) -> Result<Bytes, WireError> {
        self.validate()?;
        MapBuilder::new()
            .insert_u64("id", self.id)
            .insert_bytes("ice_msg", &self.ice_msg)
            .insert_bool("isAnswer", self.is_answer)
            .insert_str("connType", &self.conn_type)
            .build()
    }

    /// Decode a request, rejecting missing fields and oversized values
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let parsed = map::parse_map(raw)?;
        let request = Self {
            id: map::get_u64(&parsed, "id").ok_or(WireError::Malformed)?,
            ice_msg: map::get_bytes(&parsed, "ice_msg").ok_or(WireError::Malformed)?,
            is_answer: map::get_bool(&parsed, "isAnswer").ok_or(WireError::Malformed)?,
            conn_type: map::get_str(&parsed, "connType").ok_or(WireError::Malformed)?,
        };
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), WireError> {
        if self.id == 0 {
            return Err(WireError::Malformed);
        }
        if self.ice_msg.len() > MAX_FIELD_LEN {
            return Err(WireError::Size(self.ice_msg.len()));
        }
        if self.conn_type.len() > MAX_FIELD_LEN {
            return Err(WireError::Size(self.conn_type.len()));
        }
        Ok(())
    }
}

/// DHT listen key for a recipient device: `"peer:" || hex(device id)`
pub fn listen_key(device: &DeviceId) -> String {
    format!("{KEY_PREFIX}{device}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PeerConnectionRequest {
        PeerConnectionRequest {
            id: 0x1234_5678_9ABC_DEF0,
            ice_msg: Bytes::from_static(b"ufrag\npwd\ncandidate"),
            is_answer: false,
            conn_type: "sync".to_string(),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let req = request();
        let decoded = PeerConnectionRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn test_zero_id_rejected() {
        let mut req = request();
        req.id = 0;
        assert!(matches!(req.encode(), Err(WireError::Malformed)));

        let raw = MapBuilder::new()
            .insert_u64("id", 0)
            .insert_bytes("ice_msg", b"x")
            .insert_bool("isAnswer", false)
            .insert_str("connType", "")
            .build()
            .unwrap();
        assert!(matches!(
            PeerConnectionRequest::decode(&raw),
            Err(WireError::Malformed)
        ));
    }

    #[test]
    fn test_oversized_ice_msg_rejected() {
        let mut req = request();
        req.ice_msg = Bytes::from(vec![0u8; MAX_FIELD_LEN + 1]);
        assert!(matches!(req.encode(), Err(WireError::Size(_))));
    }

    #[test]
    fn test_missing_field_rejected() {
        let raw = MapBuilder::new()
            .insert_u64("id", 1)
            .insert_bool("isAnswer", true)
            .build()
            .unwrap();
        assert!(matches!(
            PeerConnectionRequest::decode(&raw),
            Err(WireError::Malformed)
        ));
    }

    #[test]
    fn test_listen_key_shape() {
        let id = DeviceId::from_public_key_der(b"pk");
        let key = listen_key(&id);
        assert!(key.starts_with("peer:"));
        assert_eq!(key.len(), 5 + 64);
    }
}
