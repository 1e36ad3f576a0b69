//! Transport seam
//!
//! Sessions only see [`Transport`] and [`TransportOpener`]; production uses
//! tokio-tungstenite, tests plug in scripted connections.

use crate::error::BoxError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;
use url::Url;

/// Close frame as seen by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// One inbound message. `Close(None)` covers an abrupt end of stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// A duplex, message-framed connection
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), BoxError>;

    /// Must be cancel safe; sessions race it against timers.
    async fn recv(&mut self) -> Result<WireMessage, BoxError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), BoxError>;
}

/// Opens transports
#[async_trait]
pub trait TransportOpener: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>, BoxError>;
}

/// WebSocket opener backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketOpener;

#[async_trait]
impl TransportOpener for WebSocketOpener {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>, BoxError> {
        let (stream, response) = connect_async(url.as_str()).await?;
        trace!(status = %response.status(), url = %url, "WebSocket handshake complete");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), BoxError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<WireMessage, BoxError> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Ok(WireMessage::Close(None)),
            };

            match message {
                Message::Text(text) => return Ok(WireMessage::Text(text.as_str().to_owned())),
                Message::Binary(bytes) => return Ok(WireMessage::Binary(bytes.to_vec())),
                Message::Close(frame) => {
                    return Ok(WireMessage::Close(frame.map(|frame| CloseFrame {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_owned(),
                    })))
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), BoxError> {
        let frame = WsCloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.stream.close(Some(frame)).await?;
        Ok(())
    }
}
