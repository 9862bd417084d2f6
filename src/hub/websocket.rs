//! WebSocket transport for edge sessions
//!
//! Edges open `GET /events` over mutual TLS. One JSON envelope travels per
//! text frame; binary frames carrying JSON are accepted as well.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::transport::{MessageReader, MessageWriter, TransportError};
use super::CloudHub;
use crate::message::Message;
use crate::tls::{PeerCertAcceptor, PeerCertificates};
use crate::Error;

/// Path edges connect to
pub const EVENTS_PATH: &str = "/events";

/// Reads envelopes from a stream of WebSocket frames
pub struct WsReader<S> {
    stream: S,
}

impl<S> WsReader<S> {
    /// Wrap the receiving half of a socket
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S, E> MessageReader for WsReader<S>
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
    E: Display,
{
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let frame = match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(frame)) => frame,
            };
            let decoded = match frame {
                WsMessage::Text(text) => Message::decode(text.as_bytes()),
                WsMessage::Binary(bytes) => Message::decode(&bytes),
                WsMessage::Close(_) => return Ok(None),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            };
            return decoded
                .map(Some)
                .map_err(|e| TransportError::Codec(e.to_string()));
        }
    }
}

/// Writes envelopes as WebSocket text frames
pub struct WsWriter<S> {
    sink: S,
}

impl<S> WsWriter<S> {
    /// Wrap the sending half of a socket
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S, E> MessageWriter for WsWriter<S>
where
    S: Sink<WsMessage, Error = E> + Unpin + Send,
    E: Display,
{
    async fn write_message(&mut self, msg: &Message) -> Result<(), TransportError> {
        let text = msg
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Router serving the edge events endpoint
pub fn router(hub: Arc<CloudHub>) -> Router {
    Router::new()
        .route(EVENTS_PATH, get(events_handler))
        .with_state(hub)
}

async fn events_handler(
    State(hub): State<Arc<CloudHub>>,
    peer: Option<Extension<PeerCertificates>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match peer.and_then(|Extension(peer)| peer.identity()) {
        Some(identity) if !identity.node_id.is_empty() => identity,
        _ => {
            return (StatusCode::UNAUTHORIZED, "client certificate required").into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket: WebSocket| async move {
        let node = identity.node_id.clone();
        let (sink, stream) = socket.split();
        if let Err(e) = hub
            .serve_connection(
                identity,
                Box::new(WsReader::new(stream)),
                Box::new(WsWriter::new(sink)),
            )
            .await
        {
            debug!(node = %node, error = %e, "WebSocket session ended with error");
        }
    })
}

/// Serve the WebSocket listener until `cancel` fires
pub async fn serve(
    hub: Arc<CloudHub>,
    addr: SocketAddr,
    tls: rustls::ServerConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!(%addr, "Starting WebSocket tunnel listener");
    axum_server::bind(addr)
        .handle(handle)
        .acceptor(PeerCertAcceptor::new(tls))
        .serve(router(hub).into_make_service())
        .await
        .map_err(|e| Error::transport(format!("websocket listener failed: {}", e)))
}
