//! WebSocket implementation of [`LiveChannel`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use duet_proto::events::SendMessage;
use duet_proto::{ClientEvent, ConversationId, ServerEvent};

use crate::api::LiveChannel;
use crate::errors::CoreError;
use crate::session::Session;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsChannel {
    session: Arc<Session>,
    socket: Option<Socket>,
}

impl WsChannel {
    /// Open the channel. The relay checks the credential before upgrading.
    pub async fn connect(session: Arc<Session>) -> Result<Self, CoreError> {
        let mut channel = Self {
            session,
            socket: None,
        };
        channel.reconnect().await?;
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn open(&self) -> Result<Socket, CoreError> {
        let token = self.session.token()?;
        let mut request = self
            .session
            .ws_url()?
            .into_client_request()
            .map_err(|e| CoreError::InvalidOperation(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| CoreError::InvalidOperation("credential is not a valid header".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((socket, _)) => Ok(socket),
            Err(WsError::Http(resp)) if resp.status() == StatusCode::UNAUTHORIZED => {
                Err(CoreError::Unauthorized)
            }
            Err(e) => Err(CoreError::Transport(e.to_string())),
        }
    }

    async fn send_event(&mut self, event: &ClientEvent) -> Result<(), CoreError> {
        let text = serde_json::to_string(event)
            .map_err(|e| CoreError::InvalidOperation(e.to_string()))?;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| CoreError::Transport("not connected".to_string()))?;
        if let Err(e) = socket.send(Message::Text(text)).await {
            self.socket = None;
            return Err(CoreError::Transport(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LiveChannel for WsChannel {
    async fn join(&mut self, id: ConversationId) -> Result<(), CoreError> {
        self.send_event(&ClientEvent::join(id)).await
    }

    async fn leave(&mut self, id: ConversationId) -> Result<(), CoreError> {
        self.send_event(&ClientEvent::leave(id)).await
    }

    async fn send(&mut self, message: SendMessage) -> Result<(), CoreError> {
        self.send_event(&ClientEvent::SendMessage(message)).await
    }

    async fn next_event(&mut self) -> Result<ServerEvent, CoreError> {
        loop {
            let socket = self
                .socket
                .as_mut()
                .ok_or_else(|| CoreError::Transport("not connected".to_string()))?;
            match socket.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => return Ok(event),
                    Err(e) => warn!("ignoring malformed frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "relay closed the channel");
                    self.socket = None;
                    return Err(CoreError::Transport("connection closed".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.socket = None;
                    return Err(CoreError::Transport(e.to_string()));
                }
                None => {
                    self.socket = None;
                    return Err(CoreError::Transport("connection closed".to_string()));
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), CoreError> {
        self.socket = None;
        self.socket = Some(self.open().await?);
        debug!("live channel connected");
        Ok(())
    }
}
