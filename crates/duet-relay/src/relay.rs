//! Conversation Relay: membership, ciphertext persistence and live fan-out.

use std::sync::Arc;

use tracing::{debug, error, info};

use duet_proto::validation::validate_payload;
use duet_proto::{ConversationId, ConversationView, MessageView, ServerEvent, UserId, UserSummary};

use crate::error::RelayError;
use crate::hub::{Channel, ChannelHub};
use crate::metrics::RelayMetrics;
use crate::store::Store;

pub struct ConversationRelay {
    store: Arc<dyn Store>,
    hub: Arc<ChannelHub>,
    metrics: Arc<RelayMetrics>,
    max_ciphertext: usize,
}

impl ConversationRelay {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<ChannelHub>,
        metrics: Arc<RelayMetrics>,
        max_ciphertext: usize,
    ) -> Self {
        Self {
            store,
            hub,
            metrics,
            max_ciphertext,
        }
    }

    /// Existing conversation of the pair, or a new one. The flag is true
    /// when this call created it; creation is announced to both users.
    pub async fn create_or_get(
        &self,
        requester: UserId,
        peer: UserId,
    ) -> Result<(ConversationView, bool), RelayError> {
        if requester == peer {
            return Err(RelayError::InvalidOperation(
                "cannot start a conversation with yourself".to_string(),
            ));
        }
        if self.store.get_user(peer).await?.is_none() {
            return Err(RelayError::NotFound);
        }

        let (conversation, created) = self.store.create_or_get_conversation(requester, peer).await?;
        if created {
            info!(conversation = %conversation.id, "conversation created");
            let event = ServerEvent::ConversationCreated(conversation.clone());
            for participant in &conversation.participants {
                self.hub.broadcast(Channel::User(participant.id), &event);
            }
        }
        Ok((conversation, created))
    }

    pub async fn list_for_user(&self, user: UserId) -> Result<Vec<ConversationView>, RelayError> {
        Ok(self.store.list_conversations(user).await?)
    }

    pub async fn get(&self, requester: UserId, id: ConversationId) -> Result<ConversationView, RelayError> {
        self.ensure_member(requester, id).await
    }

    /// The conversation, if `user` takes part in it. Everyone else gets
    /// `NotFound`.
    pub async fn ensure_member(&self, user: UserId, id: ConversationId) -> Result<ConversationView, RelayError> {
        self.store
            .get_conversation(id)
            .await?
            .filter(|c| c.has_participant(user))
            .ok_or(RelayError::NotFound)
    }

    /// Every registered user except the requester.
    pub async fn list_users(&self, requester: UserId) -> Result<Vec<UserSummary>, RelayError> {
        let mut users = self.store.list_users().await?;
        users.retain(|u| u.id != requester);
        Ok(users)
    }

    /// Persist, then push to the conversation channel. A message that
    /// failed to persist is never pushed.
    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, RelayError> {
        validate_payload(&nonce, &ciphertext, self.max_ciphertext)
            .map_err(|e| RelayError::InvalidOperation(e.to_string()))?;
        self.ensure_member(sender, conversation_id).await?;

        let message = match self
            .store
            .append_message(conversation_id, sender, nonce, ciphertext)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                self.metrics.persist_failures.inc();
                error!(conversation = %conversation_id, error = %e, "message persist failed");
                return Err(e.into());
            }
        };
        self.metrics.messages_persisted.inc();

        let pushed = self.hub.broadcast(
            Channel::Conversation(conversation_id),
            &ServerEvent::MessageReceived(message.clone()),
        );
        debug!(conversation = %conversation_id, message = %message.id, pushed, "message relayed");
        Ok(message)
    }

    pub async fn fetch_history(
        &self,
        requester: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageView>, RelayError> {
        self.ensure_member(requester, conversation_id).await?;
        Ok(self.store.list_messages(conversation_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StoreError};
    use async_trait::async_trait;
    use duet_proto::{PortableKey, UserSummary};

    /// Delegates to SQLite but refuses to persist messages.
    struct FailingStore(SqliteStore);

    #[async_trait]
    impl Store for FailingStore {
        async fn create_user(&self, username: &str) -> Result<UserSummary, StoreError> {
            self.0.create_user(username).await
        }
        async fn get_user(&self, id: UserId) -> Result<Option<UserSummary>, StoreError> {
            self.0.get_user(id).await
        }
        async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
            self.0.list_users().await
        }
        async fn upsert_key(&self, user: UserId, key: &PortableKey) -> Result<Option<PortableKey>, StoreError> {
            self.0.upsert_key(user, key).await
        }
        async fn get_key(&self, user: UserId) -> Result<Option<PortableKey>, StoreError> {
            self.0.get_key(user).await
        }
        async fn create_or_get_conversation(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<(ConversationView, bool), StoreError> {
            self.0.create_or_get_conversation(a, b).await
        }
        async fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationView>, StoreError> {
            self.0.get_conversation(id).await
        }
        async fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationView>, StoreError> {
            self.0.list_conversations(user).await
        }
        async fn append_message(
            &self,
            _conversation_id: ConversationId,
            _sender: UserId,
            _nonce: Vec<u8>,
            _ciphertext: Vec<u8>,
        ) -> Result<MessageView, StoreError> {
            Err(StoreError::Task("disk full".to_string()))
        }
        async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageView>, StoreError> {
            self.0.list_messages(conversation_id).await
        }
    }

    struct Fixture {
        relay: ConversationRelay,
        hub: Arc<ChannelHub>,
        metrics: Arc<RelayMetrics>,
        alice: UserSummary,
        bob: UserSummary,
    }

    async fn fixture(store: Arc<dyn Store>) -> Fixture {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let hub = Arc::new(ChannelHub::new(16, metrics.clone()));
        let alice = store.create_user("alice").await.unwrap();
        let bob = store.create_user("bob").await.unwrap();
        Fixture {
            relay: ConversationRelay::new(store, hub.clone(), metrics.clone(), 1024),
            hub,
            metrics,
            alice,
            bob,
        }
    }

    async fn sqlite() -> Arc<dyn Store> {
        Arc::new(SqliteStore::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_or_get_is_unordered_and_idempotent() {
        let f = fixture(sqlite().await).await;
        let (first, created) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        assert!(created);
        let (second, created) = f.relay.create_or_get(f.bob.id, f.alice.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn self_and_unknown_peers_are_rejected() {
        let f = fixture(sqlite().await).await;
        assert!(matches!(
            f.relay.create_or_get(f.alice.id, f.alice.id).await,
            Err(RelayError::InvalidOperation(_))
        ));
        assert!(matches!(
            f.relay.create_or_get(f.alice.id, UserId::new()).await,
            Err(RelayError::NotFound)
        ));
    }

    #[tokio::test]
    async fn creation_is_announced_to_both_participants() {
        let f = fixture(sqlite().await).await;
        let (_a, mut rx_a) = f.hub.register(f.alice.id);
        let (_b, mut rx_b) = f.hub.register(f.bob.id);

        let (conv, _) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await {
                Some(ServerEvent::ConversationCreated(view)) => assert_eq!(view.id, conv.id),
                other => panic!("unexpected {other:?}"),
            }
        }

        f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn append_persists_then_pushes_to_joined_connections() {
        let f = fixture(sqlite().await).await;
        let (conv, _) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        let (b, mut rx_b) = f.hub.register(f.bob.id);
        f.hub.subscribe(b, Channel::Conversation(conv.id));

        let sent = f
            .relay
            .append_message(conv.id, f.alice.id, vec![1; 24], vec![2; 32])
            .await
            .unwrap();
        assert_eq!(rx_b.recv().await, Some(ServerEvent::MessageReceived(sent.clone())));
        assert_eq!(f.relay.fetch_history(f.bob.id, conv.id).await.unwrap(), vec![sent]);
        assert_eq!(f.metrics.messages_persisted.get(), 1.0);
    }

    #[tokio::test]
    async fn persist_failure_suppresses_broadcast() {
        let store: Arc<dyn Store> = Arc::new(FailingStore(SqliteStore::open_in_memory().await.unwrap()));
        let f = fixture(store).await;
        let (conv, _) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        let (b, mut rx_b) = f.hub.register(f.bob.id);
        f.hub.subscribe(b, Channel::Conversation(conv.id));

        let result = f
            .relay
            .append_message(conv.id, f.alice.id, vec![1; 24], vec![2; 32])
            .await;
        assert!(matches!(result, Err(RelayError::Store(_))));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(f.metrics.persist_failures.get(), 1.0);
        assert_eq!(f.metrics.pushes_delivered.get(), 0.0);
    }

    #[tokio::test]
    async fn outsiders_see_nothing() {
        let f = fixture(sqlite().await).await;
        let (conv, _) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        let mallory = UserId::new();

        assert!(matches!(f.relay.get(mallory, conv.id).await, Err(RelayError::NotFound)));
        assert!(matches!(
            f.relay.fetch_history(mallory, conv.id).await,
            Err(RelayError::NotFound)
        ));
        assert!(matches!(
            f.relay.append_message(conv.id, mallory, vec![0; 24], vec![0; 16]).await,
            Err(RelayError::NotFound)
        ));
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let f = fixture(sqlite().await).await;
        let (conv, _) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();
        for (nonce, ct) in [(12, 32), (24, 8), (24, 2048)] {
            assert!(matches!(
                f.relay
                    .append_message(conv.id, f.alice.id, vec![0; nonce], vec![0; ct])
                    .await,
                Err(RelayError::InvalidOperation(_))
            ));
        }
        assert!(f.relay.fetch_history(f.alice.id, conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_senders_share_one_order() {
        let f = Arc::new(fixture(sqlite().await).await);
        let (conv, _) = f.relay.create_or_get(f.alice.id, f.bob.id).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20u8 {
            let f = f.clone();
            let sender = if i % 2 == 0 { f.alice.id } else { f.bob.id };
            tasks.push(tokio::spawn(async move {
                f.relay
                    .append_message(conv.id, sender, vec![i; 24], vec![i; 16])
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history = f.relay.fetch_history(f.alice.id, conv.id).await.unwrap();
        assert_eq!(history.len(), 20);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(history, f.relay.fetch_history(f.bob.id, conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_users_excludes_requester() {
        let f = fixture(sqlite().await).await;
        let users = f.relay.list_users(f.alice.id).await.unwrap();
        assert_eq!(users, vec![f.bob.clone()]);
    }
}
