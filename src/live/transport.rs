//! Remote channel for live sessions.
//!
//! [`LiveConnector`] opens a [`LiveTransport`]; the WebSocket implementation
//! uses tokio-tungstenite. Tests substitute in-memory fakes.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};
use url::Url;

use super::protocol::ClientMessage;
use crate::config::ApiConfig;
use crate::error::{AuraError, Result};

/// An open bidirectional channel.
#[async_trait]
pub trait LiveTransport: Send {
    /// Send one client message.
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next server payload. `None` once the peer has closed the channel.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;

    /// Close the channel. Safe to call on an already-closed channel.
    async fn close(&mut self) -> Result<()>;
}

/// Opens live channels. One call = one connection attempt.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LiveTransport>>;
}

/// Connects to the live endpoint over WebSocket.
pub struct WebSocketConnector {
    url: Url,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The query string carries the API key.
        f.debug_struct("WebSocketConnector")
            .field("host", &self.url.host_str())
            .field("path", &self.url.path())
            .finish()
    }
}

impl WebSocketConnector {
    /// Build the endpoint URL with the API key as a query parameter.
    ///
    /// # Errors
    ///
    /// Config errors for a missing key or an unparseable `live_url`.
    pub fn from_config(api: &ApiConfig) -> Result<Self> {
        let api_key = api.resolve_api_key()?;
        Self::new(&api.live_url, &api_key)
    }

    /// # Errors
    ///
    /// Returns a config error if `endpoint` is not a valid URL.
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| AuraError::Config(format!("invalid live_url '{endpoint}': {e}")))?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(Self { url })
    }
}

#[async_trait]
impl LiveConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn LiveTransport>> {
        debug!(host = ?self.url.host_str(), "connecting live channel");
        let (stream, response) = connect_async(self.url.as_str()).await?;
        info!(status = response.status().as_u16(), "live channel connected");
        Ok(Box::new(WebSocketTransport {
            stream,
            closed: false,
        }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl LiveTransport for WebSocketTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if self.closed {
            return Err(AuraError::SessionClosed("live channel closed".into()));
        }
        let json = serde_json::to_string(message)
            .map_err(|e| AuraError::Protocol(format!("cannot encode client message: {e}")))?;
        self.stream.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.into_bytes())),
                Some(Ok(Message::Binary(bytes))) => return Some(Ok(bytes)),
                Some(Ok(Message::Close(frame))) => {
                    log_close(frame.as_ref());
                    self.closed = true;
                    return None;
                }
                // Ping/Pong handled by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.close(None).await {
            Ok(())
            | Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            ) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn log_close(frame: Option<&CloseFrame<'_>>) {
    match frame {
        Some(frame) => info!(code = %frame.code, reason = %frame.reason, "live channel closed by server"),
        None => info!("live channel closed by server"),
    }
}
