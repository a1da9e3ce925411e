//! JSON WebSocket client for the relay protocol.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long `recv_json` waits for the next text frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    /// Open a relay connection. Fails if the server refuses the upgrade.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;
        Ok(Self { stream })
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(value.to_string())).await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next JSON text frame, skipping control frames.
    pub async fn recv_json(&mut self) -> Result<Value, anyhow::Error> {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
                    Some(Ok(Message::Close(frame))) => {
                        return Err(anyhow::anyhow!("connection closed: {:?}", frame))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(anyhow::anyhow!("receive failed: {}", e)),
                    None => return Err(anyhow::anyhow!("connection ended")),
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for a message"))?
    }

    /// Receive until a frame of `message_type` arrives; earlier frames are
    /// discarded.
    pub async fn recv_type(&mut self, message_type: &str) -> Result<Value, anyhow::Error> {
        loop {
            let value = self.recv_json().await?;
            if value.get("type").and_then(Value::as_str) == Some(message_type) {
                return Ok(value);
            }
        }
    }

    /// Assert that no text frame arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(wait, self.recv_json()).await {
            Err(_) => Ok(()),
            Ok(Err(_)) => Ok(()),
            Ok(Ok(value)) => Err(anyhow::anyhow!("unexpected message: {}", value)),
        }
    }

    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream.close(None).await?;
        Ok(())
    }
}
