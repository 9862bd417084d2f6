//! TAP tunnel
//!
//! An edge opens `GET /stream` over mutual TLS and exchanges raw L2 frames
//! with the local TAP device as binary WebSocket messages. One stream owns
//! the device at a time; a second stream is refused until the first ends.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CloudMeshConfig;
use crate::tls::{PeerCertAcceptor, PeerCertificates};

/// Path edges stream frames on
pub const STREAM_PATH: &str = "/stream";

/// Largest frame read from the device in one go
pub const MAX_FRAME: usize = 64 * 1024;

/// TAP tunnel failures
#[derive(Debug, Error)]
pub enum TapError {
    /// The device could not be created or configured
    #[error("tap device error: {0}")]
    Device(String),

    /// Reading from the device failed
    #[error("tap read failed: {0}")]
    Read(String),

    /// The peer connection failed
    #[error("stream failed: {0}")]
    Peer(String),
}

impl From<TapError> for crate::Error {
    fn from(e: TapError) -> Self {
        crate::Error::transport(e.to_string())
    }
}

/// Read and write halves of a frame device
pub struct DeviceHalves {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A frame device shared by successive streams
#[derive(Clone)]
pub struct TapDevice {
    name: String,
    halves: Arc<Mutex<DeviceHalves>>,
}

impl TapDevice {
    /// Wrap any byte device; used with in-memory pipes in tests
    pub fn from_io<I>(name: impl Into<String>, io: I) -> Self
    where
        I: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            name: name.into(),
            halves: Arc::new(Mutex::new(DeviceHalves {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })),
        }
    }

    /// Create and bring up the TAP interface described by `config`
    pub fn open(config: &CloudMeshConfig) -> Result<Self, TapError> {
        let tap = tokio_tun::TunBuilder::new()
            .name(&config.tap_name)
            .tap(true)
            .packet_info(false)
            .address(config.tap_ip)
            .netmask(config.tap_netmask)
            .mtu(i32::from(config.mtu))
            .up()
            .try_build()
            .map_err(|e| TapError::Device(e.to_string()))?;
        let name = tap.name().to_string();
        info!(
            name = %name,
            address = %config.tap_ip,
            netmask = %config.tap_netmask,
            mtu = config.mtu,
            "TAP device created"
        );
        Ok(Self::from_io(name, tap))
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the device for one stream, `None` while another stream holds it
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<DeviceHalves>> {
        self.halves.clone().try_lock_owned().ok()
    }
}

/// Copy frames between `device` and a WebSocket peer until either side ends
///
/// Device reads and peer reads end the stream on error; a failed device
/// write drops that frame only.
pub async fn pipe<S, E>(
    socket: S,
    device: &mut DeviceHalves,
    cancel: CancellationToken,
) -> Result<(), TapError>
where
    S: Stream<Item = Result<WsMessage, E>> + Sink<WsMessage> + Unpin + Send,
    <S as Sink<WsMessage>>::Error: Display,
    E: Display,
{
    let (mut sink, mut stream) = socket.split();
    let DeviceHalves { reader, writer } = device;

    let upstream = async {
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| TapError::Read(e.to_string()))?;
            if n == 0 {
                return Err(TapError::Read("device closed".to_string()));
            }
            sink.send(WsMessage::Binary(buf[..n].to_vec().into()))
                .await
                .map_err(|e| TapError::Peer(e.to_string()))?;
        }
    };

    let downstream = async {
        while let Some(frame) = stream.next().await {
            match frame.map_err(|e| TapError::Peer(e.to_string()))? {
                WsMessage::Binary(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        warn!(error = %e, len = bytes.len(), "Dropping frame, TAP write failed");
                    }
                }
                WsMessage::Close(_) => break,
                other => debug!(frame = ?other, "Ignoring non-binary frame"),
            }
        }
        Ok::<(), TapError>(())
    };

    tokio::select! {
        result = upstream => result,
        result = downstream => result,
        _ = cancel.cancelled() => Ok(()),
    }
}

/// Shared state of the stream listener
pub struct StreamState {
    device: TapDevice,
    cancel: CancellationToken,
}

impl StreamState {
    /// Serve `device`; open streams end when `cancel` fires
    pub fn new(device: TapDevice, cancel: CancellationToken) -> Self {
        Self { device, cancel }
    }
}

/// Router serving the stream endpoint
pub fn router(state: Arc<StreamState>) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .with_state(state)
}

async fn stream_handler(
    State(state): State<Arc<StreamState>>,
    peer: Option<Extension<PeerCertificates>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match peer.and_then(|Extension(peer)| peer.identity()) {
        Some(identity) if !identity.node_id.is_empty() => identity,
        _ => return (StatusCode::UNAUTHORIZED, "client certificate required").into_response(),
    };
    let Some(mut device) = state.device.try_acquire() else {
        return (StatusCode::CONFLICT, "device is owned by another stream").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let cancel = state.cancel.child_token();
    ws.on_upgrade(move |socket: WebSocket| async move {
        info!(node = %identity.node_id, "TAP stream opened");
        match pipe(socket, &mut device, cancel).await {
            Ok(()) => info!(node = %identity.node_id, "TAP stream closed"),
            Err(e) => info!(node = %identity.node_id, error = %e, "TAP stream ended"),
        }
    })
}

/// Serve the stream listener until `cancel` fires
pub async fn serve(
    state: Arc<StreamState>,
    addr: SocketAddr,
    tls: rustls::ServerConfig,
) -> Result<(), crate::Error> {
    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!(%addr, device = %state.device.name(), "Starting TAP stream listener");
    axum_server::bind(addr)
        .handle(handle)
        .acceptor(PeerCertAcceptor::new(tls))
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| crate::Error::transport(format!("stream listener failed: {}", e)))
}
