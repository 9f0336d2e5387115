//! Session descriptions exchanged through the rendezvous blob.

use bytes::Bytes;

use crate::IceError;

/// One transport candidate: protocol plus address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Candidate protocol: `tcp`, `udp`, or `mem`
    pub proto: String,
    /// Candidate address (socket address, or an opaque tag for `mem`)
    pub addr: String,
}

/// Local or remote session description: credentials plus candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceDescription {
    /// Username fragment
    pub ufrag: String,
    /// Password used to validate connectivity checks
    pub pwd: String,
    /// Gathered candidates, in priority order
    pub candidates: Vec<Candidate>,
}

impl IceDescription {
    /// Serialize as the line-oriented blob carried in `ice_msg`
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        out.push_str("u=");
        out.push_str(&self.ufrag);
        out.push('\n');
        out.push_str("p=");
        out.push_str(&self.pwd);
        out.push('\n');
        for candidate in &self.candidates {
            out.push_str("c=");
            out.push_str(&candidate.proto);
            out.push(' ');
            out.push_str(&candidate.addr);
            out.push('\n');
        }
        Bytes::from(out)
    }

    /// Parse a description blob
    pub fn decode(raw: &[u8]) -> Result<Self, IceError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| IceError::Description("not utf-8".to_string()))?;

        let mut ufrag = None;
        let mut pwd = None;
        let mut candidates = Vec::new();

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("u=") {
                ufrag = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("p=") {
                pwd = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("c=") {
                let (proto, addr) = value
                    .split_once(' ')
                    .ok_or_else(|| IceError::Description(format!("bad candidate: {line}")))?;
                candidates.push(Candidate {
                    proto: proto.to_string(),
                    addr: addr.to_string(),
                });
            }
            // Unknown lines are ignored for forward compatibility
        }

        let ufrag = ufrag.ok_or_else(|| IceError::Description("missing ufrag".to_string()))?;
        let pwd = pwd.ok_or_else(|| IceError::Description("missing pwd".to_string()))?;
        if ufrag.is_empty() || pwd.is_empty() {
            return Err(IceError::Description("empty credentials".to_string()));
        }

        Ok(Self {
            ufrag,
            pwd,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_roundtrip() {
        let desc = IceDescription {
            ufrag: "abcd1234".to_string(),
            pwd: "s3cr3tpassword".to_string(),
            candidates: vec![
                Candidate {
                    proto: "tcp".to_string(),
                    addr: "192.0.2.1:40100".to_string(),
                },
                Candidate {
                    proto: "udp".to_string(),
                    addr: "192.0.2.1:40101".to_string(),
                },
            ],
        };

        let decoded = IceDescription::decode(&desc.encode()).unwrap();
        assert_eq!(desc, decoded);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(IceDescription::decode(b"u=abc\n").is_err());
        assert!(IceDescription::decode(b"p=xyz\n").is_err());
        assert!(IceDescription::decode(b"u=\np=x\n").is_err());
    }

    #[test]
    fn test_unknown_lines_ignored() {
        let decoded = IceDescription::decode(b"u=a\np=b\nx=whatever\n").unwrap();
        assert_eq!(decoded.ufrag, "a");
        assert!(decoded.candidates.is_empty());
    }
}
