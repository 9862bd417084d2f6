//! HTTPS bootstrap server for edge enrollment
//!
//! Edges without a certificate present a join token; edges renewing an
//! existing certificate present it during the handshake instead.
//!
//! # Routes
//!
//! - `GET /ca.crt` returns the CA certificate (DER)
//! - `GET /edge.crt` signs the DER PKCS#10 CSR in the body and returns the
//!   DER certificate
//! - `GET /healthz` liveness probe
//!
//! # Authentication
//!
//! 1. A peer certificate is verified against the CA with the `ClientAuth`
//!    usage; any failure is a 401.
//! 2. Without one, `Authorization: Bearer <token>` is required. The token may
//!    be a bare JWT or a join token (`<ca hash>.<jwt>`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pki::token::verify_token;
use crate::pki::{verify_client_cert, HubCredentials};
use crate::tls::{PeerCertAcceptor, PeerCertificates};

/// ALPN protocols offered by the bootstrap listener
pub const ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Bootstrap endpoint errors
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Missing authorization header
    #[error("missing authorization header")]
    MissingAuth,

    /// Bad signature, expired or otherwise rejected token
    #[error("invalid or expired token")]
    InvalidToken,

    /// Token could not be decoded at all
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// Peer certificate failed verification
    #[error("invalid client certificate: {0}")]
    InvalidCertificate(String),

    /// CSR could not be parsed or signed
    #[error("invalid certificate request: {0}")]
    InvalidCsr(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for BootstrapError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            BootstrapError::MissingAuth
            | BootstrapError::InvalidToken
            | BootstrapError::InvalidCertificate(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            BootstrapError::MalformedToken(_) | BootstrapError::InvalidCsr(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            BootstrapError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Shared state of the bootstrap handlers
pub struct BootstrapState {
    credentials: Arc<HubCredentials>,
    edge_cert_signing_duration: u64,
}

impl BootstrapState {
    /// Create state signing edge certificates valid for `edge_cert_signing_duration` days
    pub fn new(credentials: Arc<HubCredentials>, edge_cert_signing_duration: u64) -> Self {
        Self {
            credentials,
            edge_cert_signing_duration,
        }
    }

    /// Authenticate a request, returning a label for logging
    fn authenticate(
        &self,
        peer: Option<&PeerCertificates>,
        headers: &HeaderMap,
    ) -> Result<String, BootstrapError> {
        if let Some(leaf) = peer.and_then(|p| p.leaf()) {
            let result = verify_client_cert(leaf, self.credentials.ca.ca_cert_pem())
                .map_err(|e| BootstrapError::InvalidCertificate(e.to_string()))?;
            return match result.identity {
                Some(identity) if result.valid => Ok(identity.node_id),
                _ => Err(BootstrapError::InvalidCertificate(
                    result.reason.unwrap_or_else(|| "rejected".to_string()),
                )),
            };
        }

        let token = extract_bearer_token(headers)?;
        verify_token(&token, &self.credentials.ca_key_der).map_err(|e| {
            if e.is_unauthorized() {
                debug!(error = %e, "Rejected bootstrap token");
                BootstrapError::InvalidToken
            } else {
                BootstrapError::MalformedToken(e.to_string())
            }
        })?;
        Ok("token".to_string())
    }

    /// Sign a DER CSR with the CA
    pub fn sign(&self, csr_der: &[u8]) -> Result<Vec<u8>, BootstrapError> {
        self.credentials
            .ca
            .sign_edge_cert(csr_der, self.edge_cert_signing_duration)
            .map_err(|e| BootstrapError::InvalidCsr(e.to_string()))
    }
}

/// Extract bearer token from headers
fn extract_bearer_token(headers: &HeaderMap) -> Result<String, BootstrapError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or(BootstrapError::MissingAuth)?;

    let auth_str = auth_header
        .to_str()
        .map_err(|_| BootstrapError::InvalidToken)?;

    auth_str
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(BootstrapError::InvalidToken)
}

/// CA certificate handler
pub async fn ca_cert_handler(State(state): State<Arc<BootstrapState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/pkix-cert")],
        state.credentials.ca_cert_der.clone(),
    )
        .into_response()
}

/// Edge certificate signing handler
pub async fn edge_cert_handler(
    State(state): State<Arc<BootstrapState>>,
    peer: Option<Extension<PeerCertificates>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BootstrapError> {
    let peer = peer.map(|Extension(p)| p);
    let subject = state
        .authenticate(peer.as_ref(), &headers)
        .inspect_err(|e| warn!(error = %e, "Edge certificate request rejected"))?;

    let cert = state.sign(&body)?;
    info!(authenticated_by = %subject, "Signed edge certificate");

    Ok(([(header::CONTENT_TYPE, "application/pkix-cert")], cert).into_response())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Create the bootstrap router
pub fn bootstrap_router(state: Arc<BootstrapState>) -> Router {
    Router::new()
        .route("/ca.crt", get(ca_cert_handler))
        .route("/edge.crt", get(edge_cert_handler).post(edge_cert_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the bootstrap listener until `cancel` fires
///
/// `tls` should request client certificates without requiring them.
pub async fn serve(
    state: Arc<BootstrapState>,
    addr: SocketAddr,
    tls: rustls::ServerConfig,
    cancel: CancellationToken,
) -> Result<(), crate::Error> {
    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!(%addr, "Starting bootstrap HTTPS server");
    axum_server::bind(addr)
        .handle(handle)
        .acceptor(PeerCertAcceptor::new(tls))
        .serve(bootstrap_router(state).into_make_service())
        .await
        .map_err(|e| crate::Error::transport(format!("bootstrap server failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::token::{generate_token, join_token};
    use crate::pki::{CertificateAuthority, EdgeCertRequest};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn credentials() -> Arc<HubCredentials> {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let server = ca
            .issue_server_cert(&["127.0.0.1".parse().unwrap()], 365)
            .unwrap();
        Arc::new(HubCredentials::new(ca, server.cert_pem, server.key_pem).unwrap())
    }

    fn router_for(credentials: Arc<HubCredentials>) -> Router {
        bootstrap_router(Arc::new(BootstrapState::new(credentials, 365)))
    }

    fn csr(node: &str) -> Vec<u8> {
        EdgeCertRequest::new(node, None).unwrap().csr_der().to_vec()
    }

    fn edge_request(auth: Option<String>, peer: Option<Vec<u8>>, body: Vec<u8>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/edge.crt");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        if let Some(peer) = peer {
            builder = builder.extension(PeerCertificates(vec![peer]));
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap()
            .to_vec()
    }

    fn common_name(der: &[u8]) -> String {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        cn.as_str().unwrap().to_string()
    }

    /// Story: HTTP error responses map to correct status codes
    #[test]
    fn story_error_http_responses() {
        // Authentication errors -> 401 Unauthorized
        assert_eq!(
            BootstrapError::MissingAuth.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BootstrapError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BootstrapError::InvalidCertificate("x".to_string())
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );

        // Undecodable input -> 400 Bad Request
        assert_eq!(
            BootstrapError::MalformedToken("x".to_string())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BootstrapError::InvalidCsr("x".to_string())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );

        // Internal errors -> 500
        assert_eq!(
            BootstrapError::Internal("secret details".to_string())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(BootstrapError::MissingAuth)
        ));

        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(BootstrapError::InvalidToken)
        ));

        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc");
    }

    #[tokio::test]
    async fn ca_cert_is_served_as_der() {
        let credentials = credentials();
        let request = Request::builder()
            .uri("/ca.crt")
            .body(Body::empty())
            .unwrap();

        let response = router_for(credentials.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, credentials.ca_cert_der);
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let response = router_for(credentials()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Story: an edge enrolls with a join token, then renews with its certificate
    #[tokio::test]
    async fn story_token_enrollment_then_certificate_renewal() {
        let credentials = credentials();
        let jwt = generate_token(&credentials.ca_key_der, Duration::from_secs(3600)).unwrap();
        let join = join_token(&credentials.ca_cert_der, &jwt);

        // Chapter 1: the operator hands out the join token
        let response = router_for(credentials.clone())
            .oneshot(edge_request(
                Some(format!("Bearer {}", join)),
                None,
                csr("edge-a"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let issued = body_bytes(response).await;
        assert_eq!(common_name(&issued), "edge-a");

        // Chapter 2: the edge renews presenting the issued certificate
        let response = router_for(credentials.clone())
            .oneshot(edge_request(None, Some(issued), csr("edge-a")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Chapter 3: the bare JWT is accepted too
        let response = router_for(credentials)
            .oneshot(edge_request(Some(format!("Bearer {}", jwt)), None, csr("edge-b")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(common_name(&body_bytes(response).await), "edge-b");
    }

    #[tokio::test]
    async fn missing_authorization_is_unauthorized() {
        let response = router_for(credentials())
            .oneshot(edge_request(None, None, csr("edge-a")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn token_from_another_ca_is_unauthorized() {
        let other = CertificateAuthority::new("Other CA").unwrap();
        let jwt = generate_token(&other.ca_key_der().unwrap(), Duration::from_secs(3600)).unwrap();

        let response = router_for(credentials())
            .oneshot(edge_request(Some(format!("Bearer {}", jwt)), None, csr("edge-a")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn undecodable_token_is_bad_request() {
        let response = router_for(credentials())
            .oneshot(edge_request(Some("Bearer a.b.c".to_string()), None, csr("edge-a")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn certificate_from_foreign_ca_is_unauthorized() {
        let foreign = CertificateAuthority::new("Foreign CA").unwrap();
        let foreign_cert = foreign
            .sign_edge_cert(&csr("edge-a"), 365)
            .unwrap();

        let credentials = credentials();
        let jwt = generate_token(&credentials.ca_key_der, Duration::from_secs(3600)).unwrap();

        // A valid token does not rescue a bad certificate
        let response = router_for(credentials)
            .oneshot(edge_request(
                Some(format!("Bearer {}", jwt)),
                Some(foreign_cert),
                csr("edge-a"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_csr_is_bad_request() {
        let credentials = credentials();
        let jwt = generate_token(&credentials.ca_key_der, Duration::from_secs(3600)).unwrap();

        let response = router_for(credentials)
            .oneshot(edge_request(
                Some(format!("Bearer {}", jwt)),
                None,
                b"not a csr".to_vec(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
