//! Transport-neutral halves of an edge connection
//!
//! The hub runs the same session logic over WebSocket and QUIC; each transport
//! only has to turn frames into [`Message`]s and back.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

/// Transport failures; any of them ends the session
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away
    #[error("connection closed")]
    Closed,

    /// A frame could not be decoded or encoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Socket level failure
    #[error("io error: {0}")]
    Io(String),

    /// A write did not complete within the write timeout
    #[error("write timed out")]
    Timeout,
}

impl From<TransportError> for crate::Error {
    fn from(e: TransportError) -> Self {
        crate::Error::transport(e.to_string())
    }
}

/// Inbound half of a connection
#[async_trait]
pub trait MessageReader: Send {
    /// Next message, `Ok(None)` on orderly close
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError>;
}

/// Outbound half of a connection
#[async_trait]
pub trait MessageWriter: Send {
    /// Send one message
    async fn write_message(&mut self, msg: &Message) -> Result<(), TransportError>;

    /// Close the connection, ignoring errors
    async fn close(&mut self);
}

/// Reader over an in-process channel
pub struct ChannelReader(pub mpsc::UnboundedReceiver<Message>);

/// Writer over an in-process channel
pub struct ChannelWriter(pub Option<mpsc::UnboundedSender<Message>>);

#[async_trait]
impl MessageReader for ChannelReader {
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.0.recv().await)
    }
}

#[async_trait]
impl MessageWriter for ChannelWriter {
    async fn write_message(&mut self, msg: &Message) -> Result<(), TransportError> {
        match &self.0 {
            Some(tx) => tx.send(msg.clone()).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.0 = None;
    }
}

/// The edge's view of an in-process connection
pub struct ChannelPeer {
    /// Messages the hub wrote
    pub inbox: mpsc::UnboundedReceiver<Message>,
    /// Messages for the hub to read
    pub outbox: mpsc::UnboundedSender<Message>,
}

/// Create an in-process connection: hub halves plus the edge side
///
/// Used for loopback sessions and to drive the hub in tests.
pub fn channel_transport() -> (ChannelReader, ChannelWriter, ChannelPeer) {
    let (to_hub, hub_rx) = mpsc::unbounded_channel();
    let (hub_tx, from_hub) = mpsc::unbounded_channel();
    (
        ChannelReader(hub_rx),
        ChannelWriter(Some(hub_tx)),
        ChannelPeer {
            inbox: from_hub,
            outbox: to_hub,
        },
    )
}
