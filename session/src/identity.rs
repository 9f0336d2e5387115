//! Device identity: a long-lived key pair and its certificate.
//!
//! The device id is the SHA-256 of the public key DER, and the
//! certificate carries a `tether://device/<hex>` SAN URI so peers can
//! be grouped by URI without re-deriving the key hash.

use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use tether_wire::DeviceId;

use crate::Error;

/// URI scheme prefix in the certificate SAN
pub const DEVICE_URI_PREFIX: &str = "tether://device/";

/// A device key pair with its self-signed certificate
pub struct DeviceIdentity {
    key: Arc<KeyPair>,
    cert_der: CertificateDer<'static>,
    id: DeviceId,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceIdentity({})", self.id.short())
    }
}

impl DeviceIdentity {
    /// Generate a fresh Ed25519 device identity
    pub fn generate() -> Result<Self, Error> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(|_| Error::Malformed)?;
        Self::from_key(key)
    }

    /// Build the identity and certificate from an existing key pair
    pub fn from_key(key: KeyPair) -> Result<Self, Error> {
        let id = DeviceId::from_public_key_der(&key.public_key_der());
        let uri = format!("{DEVICE_URI_PREFIX}{id}");

        // Some stacks balk at certificates without a SAN or DN
        let san = format!("{}.device.tether.invalid", id.short());
        let mut params = CertificateParams::new(vec![san.clone()]).map_err(|_| Error::Malformed)?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, san);
        params.subject_alt_names.push(SanType::URI(
            Ia5String::try_from(uri).map_err(|_| Error::Malformed)?,
        ));

        let cert = params.self_signed(&key).map_err(|_| Error::Malformed)?;
        Ok(Self {
            key: Arc::new(key),
            cert_der: cert.der().to_owned(),
            id,
        })
    }

    /// The device id (hash of the public key)
    pub fn device_id(&self) -> DeviceId {
        self.id
    }

    /// Public key in DER (SPKI) form
    pub fn public_key_der(&self) -> Vec<u8> {
        self.key.public_key_der()
    }

    /// Certificate in DER form
    pub fn certificate_der(&self) -> CertificateDer<'static> {
        self.cert_der.clone()
    }

    /// Private key in PKCS#8 DER form
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.serialize_der().into())
    }

    /// The `tether://device/<hex>` URI carried in the certificate
    pub fn peer_uri(&self) -> String {
        format!("{DEVICE_URI_PREFIX}{}", self.id)
    }
}

/// Derive the device id from a certificate: hash of its SPKI DER
pub fn device_id_from_cert(cert_der: &[u8]) -> Result<DeviceId, Error> {
    let (_rem, cert) =
        X509Certificate::from_der(cert_der).map_err(|_| Error::PeerIdentity)?;
    Ok(DeviceId::from_public_key_der(
        cert.tbs_certificate.subject_pki.raw,
    ))
}

/// Extract the device URI from the certificate SAN, if present
pub fn peer_uri_from_cert(cert_der: &[u8]) -> Option<String> {
    let (_rem, cert) = X509Certificate::from_der(cert_der).ok()?;
    let san = cert.subject_alternative_name().ok().flatten()?;
    for general_name in &san.value.general_names {
        if let GeneralName::URI(uri) = general_name {
            if uri.starts_with(DEVICE_URI_PREFIX) {
                return Some(uri.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_matches_cert() {
        let identity = DeviceIdentity::generate().unwrap();
        let from_cert = device_id_from_cert(identity.certificate_der().as_ref()).unwrap();
        assert_eq!(identity.device_id(), from_cert);
    }

    #[test]
    fn test_peer_uri_in_cert() {
        let identity = DeviceIdentity::generate().unwrap();
        let uri = peer_uri_from_cert(identity.certificate_der().as_ref()).unwrap();
        assert_eq!(uri, identity.peer_uri());
        assert!(uri.starts_with(DEVICE_URI_PREFIX));
    }

    #[test]
    fn test_identities_are_distinct() {
        let a = DeviceIdentity::generate().unwrap();
        let b = DeviceIdentity::generate().unwrap();
        assert_ne!(a.device_id(), b.device_id());
    }
}
