//! TLS setup shared by the bootstrap, tunnel and stream listeners
//!
//! The bootstrap server asks for a client certificate but accepts connections
//! without one, and defers verification to the handler so a bad certificate
//! maps to a 401 rather than a failed handshake. Tunnel listeners require a
//! certificate chaining to the gateway CA.
//!
//! The presented chain is attached to every request as a [`PeerCertificates`]
//! extension by [`PeerCertAcceptor`].

use std::io;
use std::sync::Arc;

use axum::middleware::AddExtension;
use axum::Extension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DistinguishedName, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::debug;

use crate::pki::{parse_pem, EdgeIdentity, HubCredentials};
use crate::Error;

/// How a listener treats client certificates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientAuth {
    /// Request a certificate, accept any or none; the handler verifies it
    Deferred,
    /// Require a certificate signed by the gateway CA
    Required,
}

/// Client certificate verifier that records whatever the peer presents
#[derive(Debug)]
pub struct PermissiveClientCertVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    schemes: Vec<SignatureScheme>,
}

impl PermissiveClientCertVerifier {
    /// Create a verifier; handshake signatures are still checked
    pub fn new() -> Result<Self, Error> {
        let inner = WebPkiClientVerifier::builder(Arc::new(RootCertStore::empty()))
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::credential(format!("failed to build client verifier: {}", e)))?;
        Ok(Self {
            schemes: inner.supported_verify_schemes(),
            inner,
        })
    }
}

impl ClientCertVerifier for PermissiveClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        debug!("Deferring client certificate verification to the handler");
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

fn server_chain(credentials: &HubCredentials) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let cert = CertificateDer::from(parse_pem(&credentials.server_cert_pem)?);
    let key = PrivatePkcs8KeyDer::from(parse_pem(&credentials.server_key_pem)?);
    Ok((vec![cert], PrivateKeyDer::Pkcs8(key)))
}

/// Build a rustls server config from the hub credentials
pub fn server_config(
    credentials: &HubCredentials,
    client_auth: ClientAuth,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig, Error> {
    let verifier: Arc<dyn ClientCertVerifier> = match client_auth {
        ClientAuth::Deferred => Arc::new(PermissiveClientCertVerifier::new()?),
        ClientAuth::Required => {
            let mut roots = RootCertStore::empty();
            roots
                .add(CertificateDer::from(credentials.ca_cert_der.clone()))
                .map_err(|e| Error::credential(format!("invalid CA certificate: {}", e)))?;
            WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::credential(format!("failed to build client verifier: {}", e)))?
        }
    };

    let (chain, key) = server_chain(credentials)?;
    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| Error::credential(format!("invalid server certificate: {}", e)))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// DER chain the peer presented during the handshake, leaf first
#[derive(Clone, Debug, Default)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

impl PeerCertificates {
    /// Leaf certificate, if any was presented
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }

    /// Identity of the leaf certificate
    pub fn identity(&self) -> Option<EdgeIdentity> {
        crate::pki::identity_from_cert(self.leaf()?).ok()
    }
}

/// Rustls acceptor that exposes the peer certificate chain to handlers
#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    /// Wrap a rustls server config
    pub fn new(config: rustls::ServerConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config))),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let chain = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.to_vec()).collect())
                .unwrap_or_default();
            let service = Extension(PeerCertificates(chain)).layer(service);
            Ok((stream, service))
        })
    }
}
