//! Persistence of hub key material
//!
//! Credentials are looked up per item in order: local PEM files, then the
//! secret store, then freshly generated. Whatever is found is written back to
//! both places so a restarted gateway (or a second replica reading the store)
//! comes up with the same CA.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use rcgen::KeyPair;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{encode_pem, parse_pem, token, CertificateAuthority, PkiError, DEFAULT_CA_COMMON_NAME};
use crate::config::CloudHubConfig;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Secret holding the CA certificate and key
pub const CA_SECRET: &str = "casecret";
/// Secret holding the hub server certificate and key
pub const SERVER_SECRET: &str = "cloudgatewaysecret";
/// Secret holding the current join token
pub const TOKEN_SECRET: &str = "tokensecret";

const CA_CERT_KEY: &str = "cadata";
const CA_KEY_KEY: &str = "cakeydata";
const SERVER_CERT_KEY: &str = "cloudhubdata";
const SERVER_KEY_KEY: &str = "cloudhubkeydata";
const TOKEN_KEY: &str = "tokendata";

const FIELD_MANAGER: &str = "cloudgateway";

/// Secret backing store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read a secret's data, `None` when the secret does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;

    /// Create or replace a secret's data
    async fn put_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error>;
}

/// Secrets stored as Kubernetes `Secret` objects
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a store backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn put_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(())
    }
}

/// Key material the hub runs with, built once at startup
#[derive(Clone)]
pub struct HubCredentials {
    /// Signing CA
    pub ca: CertificateAuthority,
    /// CA certificate DER, served from `/ca.crt`
    pub ca_cert_der: Vec<u8>,
    /// CA key SEC1 DER, the HMAC secret for join tokens
    pub ca_key_der: Vec<u8>,
    /// Server certificate PEM
    pub server_cert_pem: String,
    /// Server key PEM
    pub server_key_pem: String,
}

impl std::fmt::Debug for HubCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCredentials")
            .field("ca", &self.ca)
            .field("server_cert_pem", &self.server_cert_pem)
            .finish_non_exhaustive()
    }
}

impl HubCredentials {
    /// Assemble credentials from a CA and a server certificate it issued
    pub fn new(
        ca: CertificateAuthority,
        server_cert_pem: String,
        server_key_pem: String,
    ) -> Result<Self, PkiError> {
        Ok(Self {
            ca_cert_der: ca.ca_cert_der()?,
            ca_key_der: ca.ca_key_der()?,
            ca,
            server_cert_pem,
            server_key_pem,
        })
    }
}

fn key_der_to_pem(der: &[u8]) -> Result<String, PkiError> {
    KeyPair::try_from(der)
        .map(|k| k.serialize_pem())
        .map_err(|e| PkiError::ParseError(format!("failed to parse key: {}", e)))
}

fn key_pem_to_der(pem: &str) -> Result<Vec<u8>, PkiError> {
    KeyPair::from_pem(pem)
        .map(|k| k.serialize_der())
        .map_err(|e| PkiError::ParseError(format!("failed to parse key: {}", e)))
}

async fn read_pair(cert: &Path, key: &Path) -> Option<(String, String)> {
    let cert_pem = tokio::fs::read_to_string(cert).await.ok()?;
    let key_pem = tokio::fs::read_to_string(key).await.ok()?;
    Some((cert_pem, key_pem))
}

async fn write_file(path: &Path, content: &str, private: bool) -> Result<(), PkiError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    if private {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

async fn get_with_retry(
    store: &dyn SecretStore,
    namespace: &str,
    name: &str,
) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
    retry_with_backoff(&RetryConfig::with_max_attempts(5), name, || {
        store.get_secret(namespace, name)
    })
    .await
}

async fn put_with_retry(
    store: &dyn SecretStore,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, Vec<u8>>,
) -> Result<(), Error> {
    retry_with_backoff(&RetryConfig::with_max_attempts(5), name, || {
        store.put_secret(namespace, name, data.clone())
    })
    .await
}

fn pair_from_secret(
    data: Option<BTreeMap<String, Vec<u8>>>,
    cert_key: &str,
    key_key: &str,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut data = data?;
    let cert = data.remove(cert_key)?;
    let key = data.remove(key_key)?;
    Some((cert, key))
}

async fn prepare_ca(
    config: &CloudHubConfig,
    store: &dyn SecretStore,
) -> Result<CertificateAuthority, Error> {
    let namespace = &config.secret_namespace;

    if let Some((cert_pem, key_pem)) = read_pair(&config.tls_ca_file, &config.tls_ca_key_file).await
    {
        info!(path = ?config.tls_ca_file, "Loaded CA from file");
        return Ok(CertificateAuthority::from_pem(&cert_pem, &key_pem)?);
    }

    let stored = get_with_retry(store, namespace, CA_SECRET).await?;
    if let Some((cert_der, key_der)) = pair_from_secret(stored, CA_CERT_KEY, CA_KEY_KEY) {
        info!(secret = CA_SECRET, "Loaded CA from secret store");
        return Ok(CertificateAuthority::from_der(&cert_der, &key_der)?);
    }

    info!(common_name = DEFAULT_CA_COMMON_NAME, "Generating new CA");
    Ok(CertificateAuthority::new(DEFAULT_CA_COMMON_NAME)?)
}

async fn prepare_server_cert(
    config: &CloudHubConfig,
    store: &dyn SecretStore,
    ca: &CertificateAuthority,
) -> Result<(String, String), Error> {
    let namespace = &config.secret_namespace;

    if let Some(pair) = read_pair(&config.tls_cert_file, &config.tls_private_key_file).await {
        info!(path = ?config.tls_cert_file, "Loaded server certificate from file");
        key_pem_to_der(&pair.1)?;
        return Ok(pair);
    }

    let stored = get_with_retry(store, namespace, SERVER_SECRET).await?;
    if let Some((cert_der, key_der)) = pair_from_secret(stored, SERVER_CERT_KEY, SERVER_KEY_KEY) {
        info!(secret = SERVER_SECRET, "Loaded server certificate from secret store");
        return Ok((encode_pem("CERTIFICATE", &cert_der), key_der_to_pem(&key_der)?));
    }

    let ips = config.advertise_ips()?;
    info!(addresses = ?ips, "Issuing new server certificate");
    let server = ca.issue_server_cert(&ips, config.edge_cert_signing_duration)?;
    Ok((server.cert_pem, server.key_pem))
}

/// Ensure the CA and server credentials exist and persist them everywhere
pub async fn prepare_all_certs(
    config: &CloudHubConfig,
    store: &dyn SecretStore,
) -> Result<HubCredentials, Error> {
    let namespace = &config.secret_namespace;

    let ca = prepare_ca(config, store).await?;
    let ca_cert_der = ca.ca_cert_der()?;
    let ca_key_der = ca.ca_key_der()?;

    write_file(&config.tls_ca_file, ca.ca_cert_pem(), false).await?;
    write_file(&config.tls_ca_key_file, &ca.ca_key_pem(), true).await?;
    put_with_retry(
        store,
        namespace,
        CA_SECRET,
        BTreeMap::from([
            (CA_CERT_KEY.to_string(), ca_cert_der.clone()),
            (CA_KEY_KEY.to_string(), ca_key_der.clone()),
        ]),
    )
    .await?;

    let (server_cert_pem, server_key_pem) = prepare_server_cert(config, store, &ca).await?;

    write_file(&config.tls_cert_file, &server_cert_pem, false).await?;
    write_file(&config.tls_private_key_file, &server_key_pem, true).await?;
    put_with_retry(
        store,
        namespace,
        SERVER_SECRET,
        BTreeMap::from([
            (SERVER_CERT_KEY.to_string(), parse_pem(&server_cert_pem)?),
            (SERVER_KEY_KEY.to_string(), key_pem_to_der(&server_key_pem)?),
        ]),
    )
    .await?;

    Ok(HubCredentials::new(ca, server_cert_pem, server_key_pem)?)
}

/// Sign a join token valid for `ttl` and store it in `tokensecret`
pub async fn publish_join_token(
    store: &dyn SecretStore,
    namespace: &str,
    credentials: &HubCredentials,
    ttl: Duration,
) -> Result<String, Error> {
    let jwt = token::generate_token(&credentials.ca_key_der, ttl)?;
    let join = token::join_token(&credentials.ca_cert_der, &jwt);
    store
        .put_secret(
            namespace,
            TOKEN_SECRET,
            BTreeMap::from([(TOKEN_KEY.to_string(), join.clone().into_bytes())]),
        )
        .await?;
    Ok(join)
}

/// Refresh the join token every `interval` until cancelled
///
/// Each token stays valid for two intervals so edges holding the previous one
/// can still enroll right after a refresh.
pub async fn run_token_refresh(
    store: Arc<dyn SecretStore>,
    namespace: String,
    credentials: Arc<HubCredentials>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match publish_join_token(store.as_ref(), &namespace, &credentials, interval * 2).await {
            Ok(_) => info!(secret = TOKEN_SECRET, "Join token refreshed"),
            Err(e) => warn!(error = %e, "Failed to refresh join token"),
        }
    }
}
