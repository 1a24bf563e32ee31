//! WebSocket transport over tokio-tungstenite

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Connector, Inbound, Transport};
use crate::error::{Result, SessionError};

/// Connects `ws://` and `wss://` endpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>> {
        debug!(endpoint, "connecting websocket");

        let (stream, response) =
            connect_async(endpoint)
                .await
                .map_err(|e| SessionError::ConnectionError {
                    endpoint: endpoint.to_string(),
                    message: e.to_string(),
                })?;

        info!(endpoint, status = %response.status(), "websocket connected");

        Ok(Box::new(WebSocketTransport::new(stream)))
    }
}

/// An established WebSocket connection
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    open: bool,
}

impl WebSocketTransport {
    pub fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self { stream, open: true }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        if !self.open {
            return Err(SessionError::TransportClosed);
        }

        let len = payload.len();
        if let Err(e) = self.stream.send(Message::Binary(payload)).await {
            warn!(?e, "websocket send failed");
            self.open = false;
            return Err(SessionError::TransportClosed);
        }

        debug!(bytes = len, "websocket message sent");
        Ok(())
    }

    async fn recv(&mut self) -> Option<Inbound> {
        if !self.open {
            return None;
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Some(Inbound::Binary(bytes)),
                Some(Ok(Message::Text(text))) => {
                    return Some(Inbound::Unexpected(format!("text frame ({} bytes)", text.len())))
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                    continue
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "websocket closed by peer");
                    self.open = false;
                    return None;
                }
                Some(Err(e)) => {
                    warn!(?e, "websocket receive failed");
                    self.open = false;
                    return None;
                }
                None => {
                    self.open = false;
                    return None;
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.stream.close(None).await {
            debug!(?e, "websocket close handshake failed");
        }
    }
}
