//! Canonical CBOR map building and parsing.
//!
//! Every tether wire value (mux frames, control payloads, rendezvous
//! requests) is a CBOR map with short text keys. This module provides a
//! small builder and typed readers over `ciborium::Value`.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::WireError;

/// CBOR map builder helper
#[derive(Debug, Clone, Default)]
pub struct MapBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MapBuilder {
    /// Create a new map builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unsigned integer value
    pub fn insert_u64(mut self, key: &str, value: u64) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert binary data
    pub fn insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bytes(value.to_vec()));
        self
    }

    /// Insert a boolean value
    pub fn insert_bool(mut self, key: &str, value: bool) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bool(value));
        self
    }

    /// Build the map as CBOR bytes
    pub fn build(self) -> Result<Bytes, WireError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| WireError::Meta)?;
        Ok(Bytes::from(buf))
    }
}

/// Parse CBOR bytes into a keyed map
pub fn parse_map(raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, WireError> {
    let value: ciborium::Value = ciborium::from_reader(raw).map_err(|_| WireError::Meta)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(WireError::Meta)
    }
}

/// Get an unsigned integer value from a parsed map
pub fn get_u64(map: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u64> {
    map.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get a string value from a parsed map
pub fn get_str(map: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    map.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Get binary data from a parsed map
pub fn get_bytes(map: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<Bytes> {
    map.get(key).and_then(|v| {
        if let ciborium::Value::Bytes(b) = v {
            Some(Bytes::from(b.clone()))
        } else {
            None
        }
    })
}

/// Get a boolean value from a parsed map
pub fn get_bool(map: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<bool> {
    map.get(key).and_then(|v| {
        if let ciborium::Value::Bool(b) = v {
            Some(*b)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_roundtrip() {
        let raw = MapBuilder::new()
            .insert_u64("id", 42)
            .insert_str("name", "git")
            .insert_bytes("blob", b"abc")
            .insert_bool("answer", true)
            .build()
            .unwrap();

        let parsed = parse_map(&raw).unwrap();
        assert_eq!(get_u64(&parsed, "id"), Some(42));
        assert_eq!(get_str(&parsed, "name"), Some("git".to_string()));
        assert_eq!(get_bytes(&parsed, "blob"), Some(Bytes::from_static(b"abc")));
        assert_eq!(get_bool(&parsed, "answer"), Some(true));
        assert_eq!(get_u64(&parsed, "missing"), None);
    }

    #[test]
    fn test_parse_rejects_non_map() {
        let mut buf = Vec::new();
        ciborium::into_writer(&ciborium::Value::Integer(7.into()), &mut buf).unwrap();
        assert!(parse_map(&buf).is_err());
    }
}
