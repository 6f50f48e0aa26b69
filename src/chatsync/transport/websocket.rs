use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connector, Transport};
use crate::error::{ChatSyncError, Result};
use crate::types::Credential;

/// Connects to the gateway over WebSocket, presenting the credential as a
/// bearer token.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Transport>> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|e| ChatSyncError::Transport(format!("invalid credential header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(ChatSyncError::PermissionDenied(format!(
                    "gateway rejected credential with {}",
                    response.status()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            target: "chatsync::transport::websocket::connect",
            status = %response.status(),
            "WebSocket handshake complete"
        );

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(
                            target: "chatsync::transport::websocket::recv",
                            "Dropping non UTF-8 binary frame"
                        );
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::debug!(
                        target: "chatsync::transport::websocket::recv",
                        "Server sent close frame: {:?}",
                        frame
                    );
                    return None;
                }
                // Ping/pong are answered by tungstenite.
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
