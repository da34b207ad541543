use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use courier_types::events::{ClientCommand, ServerEvent};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("gateway closed the connection")]
    Closed,
}

/// One WebSocket connection to the gateway.
pub struct GatewayLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl GatewayLink {
    pub async fn connect(url: &str) -> Result<Self, LinkError> {
        let (ws, _) = connect_async(url).await?;
        debug!("Connected to gateway at {}", url);
        Ok(Self { ws })
    }

    pub async fn send(&mut self, command: &ClientCommand) -> Result<(), LinkError> {
        let text = serde_json::to_string(command)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next decoded event. `None` once the gateway closed the connection.
    /// Undecodable frames are logged and skipped.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent, LinkError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                    Ok(event) => return Some(Ok(event)),
                    Err(e) => warn!("Undecodable gateway event: {}", e),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("Gateway close failed: {}", e);
        }
    }
}
