//! Mutually-authenticated TLS over the negotiated ICE stream.
//!
//! The initiator acts as TLS client and pins the expected device id;
//! the responder acts as TLS server and defers to the certificate
//! store capability. Both sides present their device certificate and
//! TLS 1.3 is the only accepted version. After the handshake a
//! tie-break token is exported for simultaneous-connect arbitration.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use tether_wire::DeviceId;

use crate::identity::{device_id_from_cert, DeviceIdentity};
use crate::Error;

/// ALPN protocol announced by both sides
pub const ALPN: &[u8] = b"tether/1";

/// Exporter label for the simultaneous-connect tie-break token
const TIE_BREAK_LABEL: &[u8] = b"tether tie-break";

/// SNI placeholder; identity comes from the pinned certificate
const SNI: &str = "device.tether.invalid";

/// Trust policy for inbound certificate chains, provided by the host
pub trait CertificateStore: Send + Sync {
    /// Accept or reject a presented certificate chain
    fn validate(&self, chain: &[CertificateDer<'_>]) -> Result<(), CertificateError>;
}

/// Store accepting every chain; tests and closed deployments only
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllStore;

impl CertificateStore for AllowAllStore {
    fn validate(&self, _chain: &[CertificateDer<'_>]) -> Result<(), CertificateError> {
        Ok(())
    }
}

fn provider() -> Arc<CryptoProvider> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    Arc::new(rustls::crypto::ring::default_provider())
}

fn verify_sig(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> Result<HandshakeSignatureValid, rustls::Error> {
    let algos = rustls::crypto::ring::default_provider().signature_verification_algorithms;
    verify_tls13_signature(message, cert, dss, &algos)
}

fn supported_schemes() -> Vec<SignatureScheme> {
    rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

/// Client-side verifier pinning the responder's device id
#[derive(Debug)]
struct PinnedVerifier {
    expected: DeviceId,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = device_id_from_cert(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        if presented != self.expected {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        unimplemented!("tether negotiates TLS 1.3 only")
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_sig(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Server-side verifier deferring to the certificate store capability
struct StoreVerifier {
    store: Arc<dyn CertificateStore>,
}

impl fmt::Debug for StoreVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreVerifier")
    }
}

impl ClientCertVerifier for StoreVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());
        self.store
            .validate(&chain)
            .map_err(rustls::Error::from)
            .and(Ok(ClientCertVerified::assertion()))
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        unimplemented!("tether negotiates TLS 1.3 only")
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_sig(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Unified stream type over either handshake role
pub enum TlsStream<S> {
    /// Initiator side
    Client(tokio_rustls::client::TlsStream<S>),
    /// Responder side
    Server(tokio_rustls::server::TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TlsStream::Client(stream) => Pin::new(stream).poll_read(cx, buf),
            TlsStream::Server(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            TlsStream::Client(stream) => Pin::new(stream).poll_write(cx, buf),
            TlsStream::Server(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            TlsStream::Client(stream) => Pin::new(stream).poll_flush(cx),
            TlsStream::Server(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            TlsStream::Client(stream) => Pin::new(stream).poll_shutdown(cx),
            TlsStream::Server(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Authenticated session: the stream plus the pinned peer identity
pub struct TlsSession<S> {
    /// The reliable, ordered, encrypted byte stream
    pub stream: TlsStream<S>,
    /// Peer certificate in DER form
    pub peer_cert: Vec<u8>,
    /// Peer device id derived from the certificate
    pub peer_id: DeviceId,
    /// Exporter-derived token, identical on both ends of this session
    pub tie_break: [u8; 32],
}

/// Run the client-side handshake, pinning `expected`
pub async fn connect_tls<S>(
    identity: &DeviceIdentity,
    expected: DeviceId,
    stream: S,
) -> Result<TlsSession<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let provider = provider();
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|_| Error::TlsHandshakeFailed)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier { expected }))
        .with_client_auth_cert(
            vec![identity.certificate_der()],
            identity.private_key_der(),
        )
        .map_err(|_| Error::TlsHandshakeFailed)?;
    config.alpn_protocols = vec![ALPN.to_vec()];

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(SNI).map_err(|_| Error::TlsHandshakeFailed)?;
    let tls = connector.connect(server_name, stream).await.map_err(|e| {
        debug!("client handshake failed: {}", e);
        classify_handshake_error(&e)
    })?;

    let (peer_cert, tie_break) = {
        let conn = tls.get_ref().1;
        let cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .ok_or(Error::PeerIdentity)?;
        let token = conn
            .export_keying_material([0u8; 32], TIE_BREAK_LABEL, None)
            .map_err(|_| Error::TlsHandshakeFailed)?;
        (cert, token)
    };

    let peer_id = device_id_from_cert(&peer_cert)?;
    if peer_id != expected {
        return Err(Error::PeerIdentity);
    }

    Ok(TlsSession {
        stream: TlsStream::Client(tls),
        peer_cert,
        peer_id,
        tie_break,
    })
}

/// Run the server-side handshake, validating the client chain through
/// the certificate store
pub async fn accept_tls<S>(
    identity: &DeviceIdentity,
    store: Arc<dyn CertificateStore>,
    stream: S,
) -> Result<TlsSession<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let provider = provider();
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|_| Error::TlsHandshakeFailed)?
        .with_client_cert_verifier(Arc::new(StoreVerifier { store }))
        .with_single_cert(
            vec![identity.certificate_der()],
            identity.private_key_der(),
        )
        .map_err(|_| Error::TlsHandshakeFailed)?;
    config.alpn_protocols = vec![ALPN.to_vec()];

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls = acceptor.accept(stream).await.map_err(|e| {
        debug!("server handshake failed: {}", e);
        Error::TlsHandshakeFailed
    })?;

    let (peer_cert, tie_break) = {
        let conn = tls.get_ref().1;
        let cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
            .ok_or(Error::PeerIdentity)?;
        let token = conn
            .export_keying_material([0u8; 32], TIE_BREAK_LABEL, None)
            .map_err(|_| Error::TlsHandshakeFailed)?;
        (cert, token)
    };

    let peer_id = device_id_from_cert(&peer_cert)?;

    Ok(TlsSession {
        stream: TlsStream::Server(tls),
        peer_cert,
        peer_id,
        tie_break,
    })
}

/// Map a client handshake failure onto a connection error kind
fn classify_handshake_error(e: &std::io::Error) -> Error {
    let text = e.to_string();
    if text.contains("ApplicationVerificationFailure") || text.contains("BadEncoding") {
        Error::PeerIdentity
    } else {
        Error::TlsHandshakeFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pinned_handshake_roundtrip() {
        let client_identity = DeviceIdentity::generate().unwrap();
        let server_identity = DeviceIdentity::generate().unwrap();
        let expected = server_identity.device_id();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let store: Arc<dyn CertificateStore> = Arc::new(AllowAllStore);

        let (client, server) = tokio::join!(
            connect_tls(&client_identity, expected, client_io),
            accept_tls(&server_identity, store, server_io),
        );
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.peer_id, server_identity.device_id());
        assert_eq!(server.peer_id, client_identity.device_id());
        // Both ends export the same tie-break token
        assert_eq!(client.tie_break, server.tie_break);

        // Bytes flow both ways through the record layer
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut cs = client.stream;
        let mut ss = server.stream;
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            ss.read_exact(&mut buf).await.unwrap();
            ss.write_all(&buf).await.unwrap();
            ss.flush().await.unwrap();
        });
        cs.write_all(b"hello").await.unwrap();
        cs.flush().await.unwrap();
        let mut buf = [0u8; 5];
        cs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_pin_mismatch_aborts() {
        let client_identity = DeviceIdentity::generate().unwrap();
        let server_identity = DeviceIdentity::generate().unwrap();
        // Expect a different device than the one answering
        let wrong = DeviceIdentity::generate().unwrap().device_id();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let store: Arc<dyn CertificateStore> = Arc::new(AllowAllStore);

        let (client, server) = tokio::join!(
            connect_tls(&client_identity, wrong, client_io),
            accept_tls(&server_identity, store, server_io),
        );
        assert!(matches!(
            client,
            Err(Error::PeerIdentity) | Err(Error::TlsHandshakeFailed)
        ));
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_store_rejection_aborts() {
        #[derive(Debug)]
        struct DenyAll;
        impl CertificateStore for DenyAll {
            fn validate(&self, _chain: &[CertificateDer<'_>]) -> Result<(), CertificateError> {
                Err(CertificateError::ApplicationVerificationFailure)
            }
        }

        let client_identity = DeviceIdentity::generate().unwrap();
        let server_identity = DeviceIdentity::generate().unwrap();
        let expected = server_identity.device_id();

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, server) = tokio::join!(
            connect_tls(&client_identity, expected, client_io),
            accept_tls(&server_identity, Arc::new(DenyAll), server_io),
        );
        assert!(server.is_err());
        assert!(client.is_err());
    }
}
