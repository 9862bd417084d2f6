//! Edge enrollment end to end
//!
//! Credentials are prepared against an in-memory secret store and files in a
//! temporary directory, then an edge fetches the CA and gets its CSR signed
//! through the bootstrap router.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use cloudgateway::bootstrap::{bootstrap_router, BootstrapState};
use cloudgateway::config::CloudHubConfig;
use cloudgateway::pki::store::{publish_join_token, TOKEN_SECRET};
use cloudgateway::pki::token::generate_token;
use cloudgateway::pki::{
    prepare_all_certs, verify_client_cert, CertificateAuthority, EdgeCertRequest, SecretStore,
};
use cloudgateway::Error;
use tower::ServiceExt;

type Secrets = BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>;

#[derive(Default)]
struct MemorySecretStore(Mutex<Secrets>);

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn put_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error> {
        self.0
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }
}

fn config_in(dir: &Path) -> CloudHubConfig {
    CloudHubConfig {
        tls_ca_file: dir.join("ca/rootCA.crt"),
        tls_ca_key_file: dir.join("ca/rootCA.key"),
        tls_cert_file: dir.join("certs/server.crt"),
        tls_private_key_file: dir.join("certs/server.key"),
        advertise_address: vec!["10.0.0.1".to_string()],
        ..Default::default()
    }
}

fn edge_cert_request(csr: &EdgeCertRequest, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/edge.crt");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(csr.csr_der().to_vec())).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

/// Story: a fresh gateway creates its CA, publishes a join token and signs
/// an edge certificate requested with it
#[tokio::test]
async fn story_edge_enrolls_with_a_join_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let store = MemorySecretStore::default();

    // Chapter 1: credentials are generated and written to disk
    let credentials = Arc::new(prepare_all_certs(&config, &store).await.unwrap());
    assert!(config.tls_ca_file.exists());
    assert!(config.tls_private_key_file.exists());

    // Chapter 2: the join token lands in the token secret
    let join = publish_join_token(&store, &config.secret_namespace, &credentials, Duration::from_secs(3600))
        .await
        .unwrap();
    let stored = store
        .get_secret(&config.secret_namespace, TOKEN_SECRET)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.values().any(|v| v == join.as_bytes()));

    let router = bootstrap_router(Arc::new(BootstrapState::new(
        credentials.clone(),
        config.edge_cert_signing_duration,
    )));

    // Chapter 3: the edge fetches the CA
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/ca.crt").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, credentials.ca_cert_der);

    // Chapter 4: the CSR is signed and the certificate verifies against the CA
    let csr = EdgeCertRequest::new("edge-a", None).unwrap();
    let response = router
        .clone()
        .oneshot(edge_cert_request(&csr, Some(&join)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cert = body_bytes(response).await;

    let result = verify_client_cert(&cert, credentials.ca.ca_cert_pem()).unwrap();
    assert!(result.valid);
    assert_eq!(result.identity.unwrap().node_id, "edge-a");

    // Chapter 5: without a token the request is refused
    let response = router.oneshot(edge_cert_request(&csr, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn restarted_gateway_keeps_its_ca() {
    let store = MemorySecretStore::default();

    let first_dir = tempfile::tempdir().unwrap();
    let first = prepare_all_certs(&config_in(first_dir.path()), &store)
        .await
        .unwrap();

    // A new host without the files recovers the CA from the secret store
    let second_dir = tempfile::tempdir().unwrap();
    let second = prepare_all_certs(&config_in(second_dir.path()), &store)
        .await
        .unwrap();

    assert_eq!(first.ca_cert_der, second.ca_cert_der);
}

#[tokio::test]
async fn tokens_from_a_foreign_ca_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemorySecretStore::default();
    let credentials = Arc::new(prepare_all_certs(&config_in(dir.path()), &store).await.unwrap());
    let router = bootstrap_router(Arc::new(BootstrapState::new(credentials, 365)));

    let foreign = CertificateAuthority::new("foreign").unwrap();
    let token = generate_token(&foreign.ca_key_der().unwrap(), Duration::from_secs(3600)).unwrap();
    let csr = EdgeCertRequest::new("edge-a", None).unwrap();

    let response = router.oneshot(edge_cert_request(&csr, Some(&token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
