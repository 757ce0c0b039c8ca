//! Websocket transport to the chat gateway. The connection is split once at
//! connect time: the session's inbound loop owns the read half and the
//! outbound loop owns the write half, so neither half is ever shared.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the gateway connection. Sole writer: the outbound loop.
#[async_trait]
pub trait ChatSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
}

/// Read half of the gateway connection. Sole reader: the inbound loop.
#[async_trait]
pub trait ChatStream: Send {
    /// Next text frame from the gateway. Control frames at the websocket
    /// layer (ping/pong) are handled below this interface.
    async fn recv_text(&mut self) -> Result<String, TransportError>;
}

pub struct GatewaySink {
    inner: SplitSink<WsStream, Message>,
}

pub struct GatewayStream {
    inner: SplitStream<WsStream>,
}

pub async fn connect(url: &str) -> Result<(GatewaySink, GatewayStream), TransportError> {
    let (ws, _) = connect_async(url).await.map_err(TransportError::Connect)?;
    tracing::info!(url, "gateway connected");
    let (sink, stream) = ws.split();
    Ok((GatewaySink { inner: sink }, GatewayStream { inner: stream }))
}

#[async_trait]
impl ChatSink for GatewaySink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(TransportError::Send)
    }
}

#[async_trait]
impl ChatStream for GatewayStream {
    async fn recv_text(&mut self) -> Result<String, TransportError> {
        loop {
            match self.inner.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(TransportError::Recv(err)),
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                // ws-level ping/pong and stray binary frames are not protocol
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    Connect(tungstenite::Error),
    Send(tungstenite::Error),
    Recv(tungstenite::Error),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "gateway connect failed: {err}"),
            Self::Send(err) => write!(f, "gateway send failed: {err}"),
            Self::Recv(err) => write!(f, "gateway receive failed: {err}"),
            Self::Closed => write!(f, "gateway connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}
