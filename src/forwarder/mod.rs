//! Local HTTP forwarder
//!
//! Listens on `127.0.0.1` and ships every request through the tunnel to the
//! site hosting the service named by the `Host` header. The service is found
//! by its `EService` name or by the `dnsName` of a `ServiceExpose`.
//!
//! Every failure is answered with `200 OK` and a plain-text body; edge-side
//! clients rely on this.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::uri::Authority;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::runtime::reflector::Store;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{EService, ServiceExpose};
use crate::hub::MessageSender;
use crate::message::{Message, Operation, Resource, GROUP_HUB, SOURCE_CLOUDGATEWAY};

/// Upper bound for waiting on the edge's reply
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest request body forwarded; base64 and the envelope must still fit in
/// one tunnel frame
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// Port assumed when `Host` carries none
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Service a host name leads to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceTarget {
    /// Site hosting the service, also the node id of its edge
    pub site: String,
    /// `EService` name
    pub service: String,
}

/// Host name lookup against the resource cache
#[cfg_attr(test, automock)]
pub trait ServiceResolver: Send + Sync {
    /// Service named `host`, directly or through a `ServiceExpose` dnsName
    fn resolve(&self, host: &str) -> Option<ServiceTarget>;
}

/// [`ServiceResolver`] over the controllers' reflector stores
pub struct StoreResolver {
    services: Store<EService>,
    exposes: Store<ServiceExpose>,
}

impl StoreResolver {
    /// Resolve against the given caches
    pub fn new(services: Store<EService>, exposes: Store<ServiceExpose>) -> Self {
        Self { services, exposes }
    }
}

impl ServiceResolver for StoreResolver {
    fn resolve(&self, host: &str) -> Option<ServiceTarget> {
        let services = self.services.state();
        let target = |svc: &EService| ServiceTarget {
            site: svc.spec.e_site_name.clone(),
            service: svc.name_any(),
        };

        if let Some(svc) = services.iter().find(|s| s.name_any() == host) {
            return Some(target(svc));
        }

        let exposes = self.exposes.state();
        let expose = exposes.iter().find(|e| e.spec.dns_name == host)?;
        services
            .iter()
            .find(|s| s.name_any() == expose.spec.e_service_name && s.namespace() == expose.namespace())
            .map(|s| target(s))
    }
}

/// Forwarding failures, all rendered as `200 OK` plain text
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The request body could not be read
    #[error("failed to read request body: {0}")]
    Body(String),

    /// No usable `Host` header
    #[error("invalid host: {0}")]
    Host(String),

    /// No service matches the host
    #[error("service {0} not found")]
    UnknownService(String),

    /// The tunnel did not deliver a reply
    #[error("failed to send message: {0}")]
    Send(String),

    /// The reply content is not a forwarded response
    #[error("failed to decode reply: {0}")]
    Reply(String),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        warn!(error = %self, "Forwarding failed");
        (StatusCode::OK, self.to_string()).into_response()
    }
}

/// Content of a forwarded request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ForwardedRequest {
    /// Request headers, multi-valued
    pub headers: BTreeMap<String, Vec<String>>,
    /// Base64 body
    pub body: String,
}

/// Content of the edge's reply
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedResponse {
    /// Response headers, multi-valued
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Upstream status code
    #[serde(default)]
    pub status_code: u16,
    /// Base64 body
    #[serde(default)]
    pub body: String,
}

/// Shared state of the forwarder
pub struct ForwarderState {
    resolver: Arc<dyn ServiceResolver>,
    sender: Arc<dyn MessageSender>,
    timeout: Duration,
    max_body: usize,
}

impl ForwarderState {
    /// Forwarder with the standard send timeout
    pub fn new(resolver: Arc<dyn ServiceResolver>, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            resolver,
            sender,
            timeout: SEND_TIMEOUT,
            max_body: MAX_BODY_LEN,
        }
    }

    /// Override the send timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the request body limit
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

/// Split `Host` into name and port, defaulting the port to 80
pub fn parse_host(headers: &HeaderMap) -> Result<(String, u16), ForwardError> {
    let raw = headers
        .get(header::HOST)
        .ok_or_else(|| ForwardError::Host("missing Host header".to_string()))?
        .to_str()
        .map_err(|e| ForwardError::Host(e.to_string()))?;
    let authority = Authority::from_str(raw).map_err(|e| ForwardError::Host(e.to_string()))?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT)))
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

async fn forward(state: &ForwarderState, request: Request) -> Result<Vec<u8>, ForwardError> {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, state.max_body)
        .await
        .map_err(|e| ForwardError::Body(e.to_string()))?;

    let (host, port) = parse_host(&parts.headers)?;
    let target = state
        .resolver
        .resolve(&host)
        .ok_or_else(|| ForwardError::UnknownService(host.clone()))?;

    let content = ForwardedRequest {
        headers: header_map(&parts.headers),
        body: STANDARD.encode(&body),
    };
    let msg = Message::new(
        SOURCE_CLOUDGATEWAY,
        GROUP_HUB,
        Resource::for_site(&target.site, &format!("{}:{}", target.service, port)),
        Operation::from(parts.method.as_str().to_string()),
        serde_json::to_value(&content).map_err(|e| ForwardError::Body(e.to_string()))?,
    );
    debug!(
        site = %target.site,
        service = %target.service,
        method = %parts.method,
        message = %msg.id,
        "Forwarding request"
    );

    let reply = state
        .sender
        .send_sync(&target.site, msg, state.timeout)
        .await
        .map_err(|e| ForwardError::Send(e.to_string()))?;

    let response: ForwardedResponse =
        serde_json::from_value(reply.content).map_err(|e| ForwardError::Reply(e.to_string()))?;
    STANDARD
        .decode(response.body.as_bytes())
        .map_err(|e| ForwardError::Reply(e.to_string()))
}

async fn forward_handler(
    State(state): State<Arc<ForwarderState>>,
    request: Request,
) -> Response {
    match forward(&state, request).await {
        Ok(body) => (StatusCode::OK, Body::from(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Router forwarding every path and method
pub fn forwarder_router(state: Arc<ForwarderState>) -> Router {
    Router::new().fallback(forward_handler).with_state(state)
}

/// Serve the forwarder on `127.0.0.1:port` until `cancel` fires
pub async fn serve(
    state: Arc<ForwarderState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), crate::Error> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::Error::transport(format!("failed to bind forwarder on {}: {}", addr, e)))?;
    info!(%addr, "HTTP forwarder listening");

    axum::serve(listener, forwarder_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| crate::Error::transport(format!("forwarder failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::MockMessageSender;
    use crate::Error;
    use axum::http::{HeaderValue, Method};
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn resolver() -> MockServiceResolver {
        let mut resolver = MockServiceResolver::new();
        resolver.expect_resolve().returning(|host| match host {
            "web" | "web.example" => Some(ServiceTarget {
                site: "edge-a".to_string(),
                service: "web".to_string(),
            }),
            _ => None,
        });
        resolver
    }

    fn app(sender: MockMessageSender) -> Router {
        forwarder_router(Arc::new(ForwarderState::new(
            Arc::new(resolver()),
            Arc::new(sender),
        )))
    }

    fn request(method: Method, host: &str, body: &str) -> Request {
        Request::builder()
            .method(method)
            .uri("/orders?limit=5")
            .header(header::HOST, host)
            .header("x-trace", "abc")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn host_port_defaults_to_80() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("web.example"));
        assert_eq!(parse_host(&headers).unwrap(), ("web.example".to_string(), 80));

        headers.insert(header::HOST, HeaderValue::from_static("web:8080"));
        assert_eq!(parse_host(&headers).unwrap(), ("web".to_string(), 8080));

        assert!(parse_host(&HeaderMap::new()).is_err());
    }

    /// Story: a request travels to the edge and the reply body comes back
    #[tokio::test]
    async fn story_request_round_trip_through_the_tunnel() {
        let sent = Arc::new(Mutex::new(Vec::<(String, Message, Duration)>::new()));
        let log = sent.clone();
        let mut sender = MockMessageSender::new();
        sender.expect_send_sync().returning(move |node, msg, timeout| {
            log.lock().unwrap().push((node.to_string(), msg.clone(), timeout));
            let reply = ForwardedResponse {
                headers: BTreeMap::new(),
                status_code: 201,
                body: STANDARD.encode("created"),
            };
            Ok(msg.reply("edge-a", serde_json::to_value(reply).unwrap()))
        });

        let response = app(sender)
            .oneshot(request(Method::POST, "web.example:8080", "{\"qty\":1}"))
            .await
            .unwrap();

        // Chapter 1: the reply body is written back with 200
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "created");

        // Chapter 2: the message addressed the service on its site
        let sent = sent.lock().unwrap();
        let (node, msg, timeout) = &sent[0];
        assert_eq!(node, "edge-a");
        assert_eq!(*timeout, SEND_TIMEOUT);
        assert_eq!(msg.router.group, GROUP_HUB);
        assert_eq!(msg.router.resource, "site/edge-a/web:8080");
        assert_eq!(msg.router.operation, Operation::from("POST".to_string()));

        let content: ForwardedRequest = serde_json::from_value(msg.content.clone()).unwrap();
        assert_eq!(content.headers["x-trace"], vec!["abc".to_string()]);
        assert_eq!(STANDARD.decode(content.body).unwrap(), b"{\"qty\":1}");
    }

    #[tokio::test]
    async fn send_failures_are_plain_text_200() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send_sync()
            .returning(|_, _, _| Err(Error::timeout("no response within 30s")));

        let response = app(sender)
            .oneshot(request(Method::GET, "web", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(text(response).await.starts_with("failed to send message:"));
    }

    #[tokio::test]
    async fn unknown_hosts_are_not_sent() {
        let mut sender = MockMessageSender::new();
        sender.expect_send_sync().never();

        let response = app(sender)
            .oneshot(request(Method::GET, "nowhere", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "service nowhere not found");
    }

    #[tokio::test]
    async fn oversized_bodies_are_not_sent() {
        let mut sender = MockMessageSender::new();
        sender.expect_send_sync().never();

        let state = ForwarderState::new(Arc::new(resolver()), Arc::new(sender)).with_max_body(16);
        let response = forwarder_router(Arc::new(state))
            .oneshot(request(Method::POST, "web", &"x".repeat(17)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(text(response).await.starts_with("failed to read request body:"));
    }

    #[test]
    fn default_body_limit_fits_a_tunnel_frame() {
        assert!(MAX_BODY_LEN / 3 * 4 + 64 * 1024 < crate::hub::quic::MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn malformed_replies_are_reported() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send_sync()
            .returning(|_, msg, _| Ok(msg.reply("edge-a", json!({"body": "%%%"}))));

        let response = app(sender)
            .oneshot(request(Method::GET, "web", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(text(response).await.starts_with("failed to decode reply:"));
    }

    #[tokio::test]
    async fn configured_timeout_reaches_the_sender() {
        let mut sender = MockMessageSender::new();
        sender
            .expect_send_sync()
            .returning(|_, _, timeout| Err(Error::timeout(format!("no response within {:?}", timeout))));

        let state = ForwarderState::new(Arc::new(resolver()), Arc::new(sender))
            .with_timeout(Duration::from_millis(50));
        let response = forwarder_router(Arc::new(state))
            .oneshot(request(Method::GET, "web", ""))
            .await
            .unwrap();

        assert_eq!(text(response).await, "failed to send message: timed out: no response within 50ms");
    }
}
