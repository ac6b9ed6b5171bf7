//! Seams between the client core and the relay.

use async_trait::async_trait;

use duet_proto::events::SendMessage;
use duet_proto::{
    ConversationId, ConversationView, MessageView, PortableKey, ServerEvent, UserId, UserSummary,
};

use crate::errors::CoreError;

/// Request/response surface of the relay, bound to one session.
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// Upsert the caller's public key.
    async fn publish_key(&self, public_key: &PortableKey) -> Result<(), CoreError>;

    /// `NotFound` when the user has never published.
    async fn lookup_key(&self, user_id: UserId) -> Result<PortableKey, CoreError>;

    async fn users(&self) -> Result<Vec<UserSummary>, CoreError>;

    /// Caller's conversations, most recently active first.
    async fn conversations(&self) -> Result<Vec<ConversationView>, CoreError>;

    async fn conversation(&self, id: ConversationId) -> Result<ConversationView, CoreError>;

    /// Existing conversation with `peer_id`, or a new one.
    async fn start_conversation(&self, peer_id: UserId) -> Result<ConversationView, CoreError>;

    /// Ciphertext history, oldest first.
    async fn history(&self, id: ConversationId) -> Result<Vec<MessageView>, CoreError>;

    /// Non-real-time send path.
    async fn post_message(
        &self,
        id: ConversationId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, CoreError>;
}

/// Real-time channel to the relay.
///
/// `next_event` yields events strictly in arrival order and fails with
/// `Transport` once the connection is gone; `reconnect` re-establishes it
/// without any conversation subscriptions.
#[async_trait]
pub trait LiveChannel: Send {
    async fn join(&mut self, id: ConversationId) -> Result<(), CoreError>;
    async fn leave(&mut self, id: ConversationId) -> Result<(), CoreError>;
    async fn send(&mut self, message: SendMessage) -> Result<(), CoreError>;
    async fn next_event(&mut self) -> Result<ServerEvent, CoreError>;
    async fn reconnect(&mut self) -> Result<(), CoreError>;
}
