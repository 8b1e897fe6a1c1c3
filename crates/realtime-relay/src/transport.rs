//! Socket seam for the realtime client.

use crate::{RelayError, RelayResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// One open connection carrying text frames.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, text: String) -> RelayResult<()>;

    /// Next text frame. `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<RelayResult<String>>;

    async fn close(&mut self);
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> RelayResult<Box<dyn FrameTransport>>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> RelayResult<Box<dyn FrameTransport>> {
        info!(url = %url, "Opening realtime socket");
        let (stream, _) = connect_async(url).await?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send(&mut self, text: String) -> RelayResult<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<RelayResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8(data.to_vec()).map_err(|_| {
                        RelayError::Protocol("binary frame is not UTF-8".to_string())
                    }))
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Realtime socket closed by server");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error closing realtime socket");
        }
    }
}
