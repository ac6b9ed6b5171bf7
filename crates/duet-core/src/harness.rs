//! In-process loopback relay for exercising the client core without a
//! network. It keeps the relay's observable contract: membership checks,
//! persist-then-broadcast, at-most-once pushes to joined connections, and
//! history ordered by insertion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{EncodingKey, Header};
use tokio::sync::mpsc;

use duet_proto::events::{ConversationRef, SendMessage};
use duet_proto::validation::{sizes, validate_payload};
use duet_proto::{
    ConversationId, ConversationView, ErrorBody, MessageId, MessageView, PortableKey, ServerEvent,
    SessionClaims, UserId, UserSummary,
};

use crate::api::{LiveChannel, RelayApi};
use crate::errors::CoreError;
use crate::session::{Session, SessionCredential};

const HARNESS_SECRET: &[u8] = b"duet-loopback-harness";

/// HS256 credential for `user_id` signed with a key no real relay holds.
pub fn token_for(user_id: UserId, expires_at: DateTime<Utc>) -> Result<String, CoreError> {
    let claims = SessionClaims {
        sub: user_id,
        iat: Utc::now().timestamp(),
        exp: expires_at.timestamp(),
    };
    jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(HARNESS_SECRET))
        .map_err(|e| CoreError::Crypto(format!("signing credential: {e}")))
}

struct Connection {
    user: UserId,
    channels: HashSet<ConversationId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RelayState {
    users: HashMap<UserId, String>,
    keys: HashMap<UserId, PortableKey>,
    conversations: HashMap<ConversationId, ConversationView>,
    messages: Vec<MessageView>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    max_ciphertext: Option<usize>,
}

impl RelayState {
    fn max_ciphertext(&self) -> usize {
        self.max_ciphertext.unwrap_or(sizes::DEFAULT_MAX_CIPHERTEXT)
    }

    fn summary(&self, user: UserId) -> Option<UserSummary> {
        self.users.get(&user).map(|username| UserSummary {
            id: user,
            username: username.clone(),
        })
    }

    fn member_conversation(&self, user: UserId, id: ConversationId) -> Result<&ConversationView, CoreError> {
        self.conversations
            .get(&id)
            .filter(|c| c.has_participant(user))
            .ok_or_else(|| CoreError::NotFound("conversation".to_string()))
    }

    fn push(&mut self, filter: impl Fn(&Connection) -> bool, event: &ServerEvent) {
        self.connections
            .retain(|_, conn| !filter(conn) || conn.tx.send(event.clone()).is_ok());
    }

    fn append(
        &mut self,
        conversation_id: ConversationId,
        sender: UserId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
        broadcast: bool,
    ) -> Result<MessageView, CoreError> {
        self.member_conversation(sender, conversation_id)?;
        let sender = self
            .summary(sender)
            .ok_or_else(|| CoreError::NotFound("user".to_string()))?;
        let created_at = self
            .messages
            .last()
            .map(|m| m.created_at.max(Utc::now()))
            .unwrap_or_else(Utc::now);
        let message = MessageView {
            id: MessageId::new(),
            conversation_id,
            sender,
            nonce,
            ciphertext,
            created_at,
        };
        self.messages.push(message.clone());
        if let Some(conv) = self.conversations.get_mut(&conversation_id) {
            conv.updated_at = created_at;
        }
        if broadcast {
            let event = ServerEvent::MessageReceived(message.clone());
            self.push(|c| c.channels.contains(&conversation_id), &event);
        }
        Ok(message)
    }
}

/// Shared in-memory relay. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_user(&self, username: &str) -> UserSummary {
        let id = UserId::new();
        self.lock().users.insert(id, username.to_string());
        UserSummary {
            id,
            username: username.to_string(),
        }
    }

    /// Session with an hour-long credential for `user`.
    pub fn session_for(&self, user: UserId) -> Result<Arc<Session>, CoreError> {
        let token = token_for(user, Utc::now() + Duration::hours(1))?;
        let credential = SessionCredential::from_token(token)?;
        Ok(Arc::new(Session::new("http://loopback.invalid", credential)))
    }

    pub fn api(&self, user: UserId) -> Arc<LoopbackApi> {
        Arc::new(LoopbackApi {
            relay: self.clone(),
            user,
        })
    }

    /// A connected live channel for `user`.
    pub fn channel(&self, user: UserId) -> LoopbackChannel {
        let mut channel = LoopbackChannel {
            relay: self.clone(),
            user,
            connection: None,
        };
        channel.connect();
        channel
    }

    /// Lower (or raise) the ciphertext limit the relay enforces.
    pub fn set_max_ciphertext(&self, max: usize) {
        self.lock().max_ciphertext = Some(max);
    }

    /// Drop every live connection of `user`, as if the network went away.
    pub fn drop_connections(&self, user: UserId) {
        self.lock().connections.retain(|_, c| c.user != user);
    }

    /// Persist a message without pushing it to anyone.
    pub fn inject_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, CoreError> {
        self.lock()
            .append(conversation_id, sender, nonce, ciphertext, false)
    }

    pub fn history(&self, conversation_id: ConversationId) -> Vec<MessageView> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn connection_count(&self, user: UserId) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.user == user)
            .count()
    }
}

/// [`RelayApi`] bound to one user of a [`LoopbackRelay`].
pub struct LoopbackApi {
    relay: LoopbackRelay,
    user: UserId,
}

#[async_trait]
impl RelayApi for LoopbackApi {
    async fn publish_key(&self, public_key: &PortableKey) -> Result<(), CoreError> {
        if public_key.is_private() {
            return Err(CoreError::InvalidOperation("private material".to_string()));
        }
        self.relay.lock().keys.insert(self.user, public_key.clone());
        Ok(())
    }

    async fn lookup_key(&self, user_id: UserId) -> Result<PortableKey, CoreError> {
        self.relay
            .lock()
            .keys
            .get(&user_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound("key".to_string()))
    }

    async fn users(&self) -> Result<Vec<UserSummary>, CoreError> {
        let state = self.relay.lock();
        let mut users: Vec<UserSummary> = state
            .users
            .keys()
            .filter(|id| **id != self.user)
            .filter_map(|id| state.summary(*id))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn conversations(&self) -> Result<Vec<ConversationView>, CoreError> {
        let state = self.relay.lock();
        let mut list: Vec<ConversationView> = state
            .conversations
            .values()
            .filter(|c| c.has_participant(self.user))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn conversation(&self, id: ConversationId) -> Result<ConversationView, CoreError> {
        self.relay
            .lock()
            .member_conversation(self.user, id)
            .cloned()
    }

    async fn start_conversation(&self, peer_id: UserId) -> Result<ConversationView, CoreError> {
        if peer_id == self.user {
            return Err(CoreError::InvalidOperation("cannot start a conversation with yourself".to_string()));
        }
        let mut state = self.relay.lock();
        let peer = state
            .summary(peer_id)
            .ok_or_else(|| CoreError::NotFound("user".to_string()))?;
        if let Some(existing) = state
            .conversations
            .values()
            .find(|c| c.has_participant(self.user) && c.has_participant(peer_id))
        {
            return Ok(existing.clone());
        }
        let me = state
            .summary(self.user)
            .ok_or_else(|| CoreError::NotFound("user".to_string()))?;
        let now = Utc::now();
        let view = ConversationView {
            id: ConversationId::new(),
            participants: vec![me, peer],
            created_at: now,
            updated_at: now,
        };
        state.conversations.insert(view.id, view.clone());
        let (a, b) = (self.user, peer_id);
        let event = ServerEvent::ConversationCreated(view.clone());
        state.push(|c| c.user == a || c.user == b, &event);
        Ok(view)
    }

    async fn history(&self, id: ConversationId) -> Result<Vec<MessageView>, CoreError> {
        self.relay.lock().member_conversation(self.user, id)?;
        Ok(self.relay.history(id))
    }

    async fn post_message(
        &self,
        id: ConversationId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, CoreError> {
        let mut state = self.relay.lock();
        validate_payload(&nonce, &ciphertext, state.max_ciphertext())
            .map_err(|e| CoreError::InvalidOperation(e.to_string()))?;
        state.append(id, self.user, nonce, ciphertext, true)
    }
}

fn error_body(err: &CoreError) -> ErrorBody {
    match err {
        CoreError::NotFound(_) => ErrorBody::new("not_found", "Not found"),
        CoreError::InvalidOperation(reason) => ErrorBody::new("invalid_operation", reason.clone()),
        _ => ErrorBody::new("internal", "Internal error"),
    }
}

/// [`LiveChannel`] connected to a [`LoopbackRelay`].
pub struct LoopbackChannel {
    relay: LoopbackRelay,
    user: UserId,
    connection: Option<(u64, mpsc::UnboundedReceiver<ServerEvent>)>,
}

impl LoopbackChannel {
    fn connect(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.relay.lock();
        let id = state.next_connection;
        state.next_connection += 1;
        state.connections.insert(
            id,
            Connection {
                user: self.user,
                channels: HashSet::new(),
                tx,
            },
        );
        self.connection = Some((id, rx));
    }

    fn connection_id(&self) -> Result<u64, CoreError> {
        self.connection
            .as_ref()
            .map(|(id, _)| *id)
            .ok_or_else(|| CoreError::Transport("not connected".to_string()))
    }

    fn live_connection<'a>(
        &self,
        state: &'a mut RelayState,
    ) -> Result<&'a mut Connection, CoreError> {
        let id = self.connection_id()?;
        state
            .connections
            .get_mut(&id)
            .ok_or_else(|| CoreError::Transport("connection dropped".to_string()))
    }
}

#[async_trait]
impl LiveChannel for LoopbackChannel {
    async fn join(&mut self, id: ConversationId) -> Result<(), CoreError> {
        let mut state = self.relay.lock();
        let allowed = state.member_conversation(self.user, id).is_ok();
        let conn = self.live_connection(&mut state)?;
        let event = if allowed {
            conn.channels.insert(id);
            ServerEvent::Joined(ConversationRef {
                conversation_id: id,
            })
        } else {
            ServerEvent::Error(ErrorBody::new("not_found", "Not found"))
        };
        let _ = conn.tx.send(event);
        Ok(())
    }

    async fn leave(&mut self, id: ConversationId) -> Result<(), CoreError> {
        let mut state = self.relay.lock();
        let conn = self.live_connection(&mut state)?;
        conn.channels.remove(&id);
        Ok(())
    }

    async fn send(&mut self, message: SendMessage) -> Result<(), CoreError> {
        let mut state = self.relay.lock();
        self.live_connection(&mut state)?;
        let max = state.max_ciphertext();
        let stored = validate_payload(&message.nonce, &message.ciphertext, max)
            .map_err(|e| CoreError::InvalidOperation(e.to_string()))
            .and_then(|()| {
                state.append(
                    message.conversation_id,
                    self.user,
                    message.nonce,
                    message.ciphertext,
                    true,
                )
            });
        // refusals travel back as events, never as a failed write
        if let Err(e) = stored {
            let conn = self.live_connection(&mut state)?;
            let _ = conn.tx.send(ServerEvent::Error(error_body(&e)));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ServerEvent, CoreError> {
        let (_, rx) = self
            .connection
            .as_mut()
            .ok_or_else(|| CoreError::Transport("not connected".to_string()))?;
        match rx.recv().await {
            Some(event) => Ok(event),
            None => {
                self.connection = None;
                Err(CoreError::Transport("connection closed".to_string()))
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), CoreError> {
        if let Some((id, _)) = self.connection.take() {
            self.relay.lock().connections.remove(&id);
        }
        self.connect();
        Ok(())
    }
}
