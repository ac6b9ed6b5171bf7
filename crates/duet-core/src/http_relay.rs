//! HTTP implementation of [`RelayApi`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use duet_proto::{
    ConversationId, ConversationView, ErrorBody, KeyResponse, MessageView, PortableKey,
    PostMessageRequest, PublishKeyRequest, StartConversationRequest, UserId, UserSummary,
};

use crate::api::RelayApi;
use crate::errors::CoreError;
use crate::session::Session;

#[derive(Clone)]
pub struct HttpRelayClient {
    session: Arc<Session>,
    client: reqwest::Client,
}

impl HttpRelayClient {
    pub fn new(session: Arc<Session>) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        Ok(Self { session, client })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.session.base_url(), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, CoreError> {
        let token = self.session.token()?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        check_status(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CoreError> {
        let resp = self.send(self.client.get(self.url(path))).await?;
        decode(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, CoreError> {
    resp.json()
        .await
        .map_err(|e| CoreError::Transport(format!("bad response body: {e}")))
}

/// Map relay status codes onto the client taxonomy.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, CoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp
        .json::<ErrorBody>()
        .await
        .map(|b| b.message)
        .unwrap_or_else(|_| status.to_string());
    Err(match status {
        StatusCode::NOT_FOUND => CoreError::NotFound(detail),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            CoreError::InvalidOperation(detail)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CoreError::Unauthorized,
        s if s.is_server_error() => CoreError::Relay,
        _ => CoreError::Transport(format!("unexpected status {status}")),
    })
}

#[async_trait]
impl RelayApi for HttpRelayClient {
    async fn publish_key(&self, public_key: &PortableKey) -> Result<(), CoreError> {
        let body = PublishKeyRequest {
            public_key_material: public_key.public_only(),
        };
        self.send(self.client.post(self.url("/keys")).json(&body))
            .await?;
        Ok(())
    }

    async fn lookup_key(&self, user_id: UserId) -> Result<PortableKey, CoreError> {
        let resp: KeyResponse = self.get_json(&format!("/keys/{user_id}")).await?;
        Ok(resp.public_key_material)
    }

    async fn users(&self) -> Result<Vec<UserSummary>, CoreError> {
        self.get_json("/users").await
    }

    async fn conversations(&self) -> Result<Vec<ConversationView>, CoreError> {
        self.get_json("/conversations").await
    }

    async fn conversation(&self, id: ConversationId) -> Result<ConversationView, CoreError> {
        self.get_json(&format!("/conversations/{id}")).await
    }

    async fn start_conversation(&self, peer_id: UserId) -> Result<ConversationView, CoreError> {
        let body = StartConversationRequest { peer_id };
        let resp = self
            .send(self.client.post(self.url("/conversations")).json(&body))
            .await?;
        decode(resp).await
    }

    async fn history(&self, id: ConversationId) -> Result<Vec<MessageView>, CoreError> {
        self.get_json(&format!("/messages/{id}")).await
    }

    async fn post_message(
        &self,
        id: ConversationId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, CoreError> {
        let body = PostMessageRequest { nonce, ciphertext };
        let resp = self
            .send(self.client.post(self.url(&format!("/messages/{id}"))).json(&body))
            .await?;
        decode(resp).await
    }
}
