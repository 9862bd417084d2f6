//! QUIC transport for edge sessions
//!
//! An edge opens one bidirectional stream per session. Envelopes are framed
//! with a big-endian `u32` length prefix.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Endpoint, Incoming, RecvStream, SendStream, TransportConfig, VarInt};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{MessageReader, MessageWriter, TransportError};
use super::CloudHub;
use crate::message::Message;
use crate::pki::identity_from_cert;
use crate::Error;

/// ALPN protocol edges must offer
pub const ALPN: &[u8] = b"cloudgateway";

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads length-prefixed envelopes
pub struct FramedReader<R> {
    inner: R,
}

impl<R> FramedReader<R> {
    /// Wrap a byte stream
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageReader for FramedReader<R> {
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::Codec(format!(
                "frame of {} bytes exceeds limit",
                len
            )));
        }
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Message::decode(&buf)
            .map(Some)
            .map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Writes length-prefixed envelopes
pub struct FramedWriter<W> {
    inner: W,
}

impl<W> FramedWriter<W> {
    /// Wrap a byte sink
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageWriter for FramedWriter<W> {
    async fn write_message(&mut self, msg: &Message) -> Result<(), TransportError> {
        let payload = msg
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| TransportError::Codec("message too large".to_string()))?;
        self.inner
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.inner
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Build the quinn server config from a rustls config requiring client certs
pub fn server_config(
    mut tls: rustls::ServerConfig,
    max_incoming_streams: u32,
) -> Result<quinn::ServerConfig, Error> {
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(Arc::new(tls))
        .map_err(|e| Error::credential(format!("invalid QUIC TLS config: {}", e)))?;

    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(max_incoming_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Accept QUIC connections until `cancel` fires
pub async fn serve(
    hub: Arc<CloudHub>,
    addr: SocketAddr,
    config: quinn::ServerConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let endpoint = Endpoint::server(config, addr)
        .map_err(|e| Error::transport(format!("failed to bind QUIC endpoint {}: {}", addr, e)))?;
    info!(%addr, "Starting QUIC tunnel listener");

    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(hub, incoming).await {
                warn!(error = %e, "QUIC connection failed");
            }
        });
    }

    endpoint.close(VarInt::from_u32(0), b"shutdown");
    endpoint.wait_idle().await;
    Ok(())
}

async fn handle_connection(hub: Arc<CloudHub>, incoming: Incoming) -> Result<(), Error> {
    let connection = incoming
        .accept()
        .map_err(|e| Error::transport(e.to_string()))?
        .await
        .map_err(|e| Error::transport(e.to_string()))?;

    let identity = connection
        .peer_identity()
        .and_then(|any| any.downcast::<Vec<CertificateDer<'static>>>().ok())
        .and_then(|chain| chain.first().map(|leaf| identity_from_cert(leaf)))
        .transpose()?
        .filter(|identity| !identity.node_id.is_empty())
        .ok_or_else(|| Error::credential("QUIC peer presented no usable certificate"))?;

    let (send, recv): (SendStream, RecvStream) = match connection.accept_bi().await {
        Ok(streams) => streams,
        Err(quinn::ConnectionError::ApplicationClosed { .. })
        | Err(quinn::ConnectionError::ConnectionClosed(_)) => {
            debug!(node = %identity.node_id, "QUIC connection closed before opening a stream");
            return Ok(());
        }
        Err(e) => return Err(Error::transport(e.to_string())),
    };

    let node = identity.node_id.clone();
    let result = hub
        .serve_connection(
            identity,
            Box::new(FramedReader::new(recv)),
            Box::new(FramedWriter::new(send)),
        )
        .await;
    connection.close(VarInt::from_u32(0), b"session closed");
    if let Err(e) = &result {
        error!(node = %node, error = %e, "QUIC session rejected");
    }
    result
}
