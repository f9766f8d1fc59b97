#![expect(
    clippy::module_name_repetitions,
    reason = "Transport types expose their domain in the name for clarity"
)]

//! Abstract duplex frame stream plus the production WebSocket implementation.
//!
//! The connection layer never touches sockets directly: it drives a
//! [`TransportStream`] obtained from a [`Transport`], so tests can swap in
//! an in-process pipe and the wire encoding stays a transport concern.

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::{Error, Kind, TransportError};
use crate::protocol::ProtocolMessage;
use crate::Result;

/// Opens duplex frame streams to the realtime endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TransportStream>>;
}

/// One duplex stream of already-decoded protocol frames.
///
/// Owned exclusively by the connection task; `recv` returning `Ok(None)`
/// means the peer closed the stream in an orderly fashion.
#[async_trait]
pub trait TransportStream: Send {
    async fn send(&mut self, frame: ProtocolMessage) -> Result<()>;
    async fn recv(&mut self) -> Result<Option<ProtocolMessage>>;
    async fn close(&mut self);
}

/// Production transport: JSON-encoded frames over a WebSocket text stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn TransportStream>> {
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsFrameStream { inner: stream }))
    }
}

struct WsFrameStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportStream for WsFrameStream {
    async fn send(&mut self, frame: ProtocolMessage) -> Result<()> {
        let json = serde_json::to_string(&frame).map_err(TransportError::Codec)?;
        self.inner
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(TransportError::Connection)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ProtocolMessage>> {
        loop {
            match self.inner.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = serde_json::from_str(text.as_str())
                        .map_err(|e| Error::with_source(Kind::Transport, TransportError::Codec(e)))?;
                    return Ok(Some(frame));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {
                    // Binary frames and ping/pong control frames carry no
                    // protocol content.
                }
                Some(Err(e)) => {
                    return Err(Error::with_source(
                        Kind::Transport,
                        TransportError::Connection(e),
                    ));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
