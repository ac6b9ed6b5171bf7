//! Delivery orchestrator.
//!
//! Drives one open conversation through
//! `Initializing -> AwaitingPeerKey -> KeyEstablished -> Live -> Closed`.
//! Phases only move forward. Live events are applied strictly in the order
//! the channel yields them; a lost connection is repaired by reconnecting,
//! rejoining and rebuilding the visible list from history.
//!
//! Live sends are acknowledged by the relay echoing the message back. An
//! error event that arrives while a send is unacknowledged is reported as
//! [`CoreError::Rejected`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use duet_crypto::{IdentityKeypair, PublicKeyMaterial, SessionKey};
use duet_proto::events::SendMessage;
use duet_proto::validation::{sizes, validate_payload};
use duet_proto::{ConversationId, MessageId, MessageView, ServerEvent, UserSummary};

use crate::api::{LiveChannel, RelayApi};
use crate::errors::CoreError;
use crate::keystore::KeyStore;
use crate::session::Session;

const RECONNECT_BASE: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    AwaitingPeerKey,
    KeyEstablished,
    Live,
    Closed,
}

/// Outcome of `start` / `retry_peer_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The peer has never published a key. Retry later.
    WaitingForPeer,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// Failed authentication under the current session key.
    Undecryptable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: MessageId,
    pub sender: UserSummary,
    pub created_at: DateTime<Utc>,
    pub body: MessageBody,
}

/// How `send` transmits sealed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPath {
    #[default]
    Live,
    Http,
}

pub struct DeliveryOrchestrator {
    session: Arc<Session>,
    keystore: Arc<KeyStore>,
    api: Arc<dyn RelayApi>,
    channel: Box<dyn LiveChannel>,
    conversation_id: ConversationId,
    send_path: SendPath,

    phase: Phase,
    identity: Option<IdentityKeypair>,
    peer: Option<UserSummary>,
    session_key: Option<SessionKey>,
    /// Ciphertext fetched during Initializing, decrypted once the key exists.
    pending_history: Vec<MessageView>,
    visible: Vec<DisplayMessage>,
    seen: HashSet<MessageId>,
    /// Live sends not yet echoed back or refused.
    pending_sends: usize,
    connected: bool,
}

impl DeliveryOrchestrator {
    pub fn new(
        session: Arc<Session>,
        keystore: Arc<KeyStore>,
        api: Arc<dyn RelayApi>,
        channel: Box<dyn LiveChannel>,
        conversation_id: ConversationId,
    ) -> Self {
        Self {
            session,
            keystore,
            api,
            channel,
            conversation_id,
            send_path: SendPath::default(),
            phase: Phase::Initializing,
            identity: None,
            peer: None,
            session_key: None,
            pending_history: Vec::new(),
            visible: Vec::new(),
            seen: HashSet::new(),
            pending_sends: 0,
            connected: false,
        }
    }

    pub fn with_send_path(mut self, path: SendPath) -> Self {
        self.send_path = path;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn peer(&self) -> Option<&UserSummary> {
        self.peer.as_ref()
    }

    pub fn visible(&self) -> &[DisplayMessage] {
        &self.visible
    }

    /// Live sends the relay has neither stored nor refused yet.
    pub fn pending_sends(&self) -> usize {
        self.pending_sends
    }

    fn expect_phase(&self, expected: Phase, op: &str) -> Result<(), CoreError> {
        if self.phase != expected {
            return Err(CoreError::InvalidOperation(format!(
                "{op} not valid in phase {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Load the identity and, concurrently, the conversation and its history;
    /// then try to establish the session key.
    pub async fn start(&mut self) -> Result<Progress, CoreError> {
        self.expect_phase(Phase::Initializing, "start")?;
        self.session.ensure_valid()?;

        let keystore = self.keystore.clone();
        let api = self.api.clone();
        let id = self.conversation_id;
        let (identity, conversation, history) = tokio::join!(
            async move { tokio::task::spawn_blocking(move || keystore.load_or_generate()).await? },
            api.conversation(id),
            api.history(id),
        );
        let identity = identity?;
        let conversation = conversation?;
        let history = history?;

        let me = self.session.user_id();
        let peer = conversation
            .peer_of(me)
            .cloned()
            .ok_or_else(|| CoreError::InvalidOperation("conversation has no peer".to_string()))?;
        debug!(conversation = %id, peer = %peer.id, messages = history.len(), "conversation loaded");

        self.identity = Some(identity);
        self.peer = Some(peer);
        self.pending_history = history;
        self.phase = Phase::AwaitingPeerKey;

        self.establish().await
    }

    /// Look the peer's key up again after `Progress::WaitingForPeer`.
    pub async fn retry_peer_key(&mut self) -> Result<Progress, CoreError> {
        self.expect_phase(Phase::AwaitingPeerKey, "retry_peer_key")?;
        self.session.ensure_valid()?;
        self.establish().await
    }

    async fn establish(&mut self) -> Result<Progress, CoreError> {
        let peer_id = match &self.peer {
            Some(peer) => peer.id,
            None => return Err(CoreError::InvalidOperation("peer unknown".to_string())),
        };

        let material = match self.api.lookup_key(peer_id).await {
            Ok(material) => material,
            Err(CoreError::NotFound(_)) => {
                info!(peer = %peer_id, "peer has not published a key yet");
                return Ok(Progress::WaitingForPeer);
            }
            Err(e) => return Err(e),
        };
        let peer_key = PublicKeyMaterial::from_portable(&material)?;
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| CoreError::InvalidOperation("identity not loaded".to_string()))?;
        let key = SessionKey::derive(identity, &peer_key)?;
        info!(peer = %peer_id, peer_key = %peer_key.fingerprint(), "session key established");

        self.session_key = Some(key.clone());
        self.phase = Phase::KeyEstablished;

        let history = std::mem::take(&mut self.pending_history);
        self.visible = decrypt_all(key, history).await?;
        self.seen = self.visible.iter().map(|m| m.id).collect();

        self.go_live().await;
        Ok(Progress::Live)
    }

    async fn go_live(&mut self) {
        self.phase = Phase::Live;
        match self.channel.join(self.conversation_id).await {
            Ok(()) => self.connected = true,
            Err(e) => {
                warn!("join failed, will reconnect: {}", e);
                self.connected = false;
            }
        }
    }

    /// Seal `text` and transmit it. The sender's copy arrives back through
    /// the channel like any other message; a refusal surfaces from `pump`.
    pub async fn send(&mut self, text: &str) -> Result<(), CoreError> {
        self.expect_phase(Phase::Live, "send")?;
        self.session.ensure_valid()?;
        let key = self
            .session_key
            .as_ref()
            .ok_or_else(|| CoreError::InvalidOperation("no session key".to_string()))?;
        let sealed = key.seal_text(text)?;
        validate_payload(&sealed.nonce, &sealed.ciphertext, sizes::DEFAULT_MAX_CIPHERTEXT)
            .map_err(|e| CoreError::InvalidOperation(e.to_string()))?;

        match self.send_path {
            SendPath::Live => {
                self.channel
                    .send(SendMessage {
                        conversation_id: self.conversation_id,
                        nonce: sealed.nonce,
                        ciphertext: sealed.ciphertext,
                    })
                    .await?;
                self.pending_sends += 1;
                Ok(())
            }
            SendPath::Http => {
                let stored = self
                    .api
                    .post_message(self.conversation_id, sealed.nonce, sealed.ciphertext)
                    .await?;
                self.apply_message(&stored);
                Ok(())
            }
        }
    }

    /// Apply one channel event. Events after `close` are dropped. Relay
    /// error events are returned as errors.
    pub async fn handle_event(&mut self, event: ServerEvent) -> Result<(), CoreError> {
        match self.phase {
            Phase::Live => {}
            Phase::Closed => {
                debug!("discarding event after close");
                return Ok(());
            }
            other => {
                debug!(phase = ?other, "discarding event before live");
                return Ok(());
            }
        }

        match event {
            ServerEvent::MessageReceived(message) => {
                if message.conversation_id == self.conversation_id {
                    if message.sender.id == self.session.user_id() {
                        self.pending_sends = self.pending_sends.saturating_sub(1);
                    }
                    self.apply_message(&message);
                }
            }
            ServerEvent::Joined(joined) => {
                if joined.conversation_id == self.conversation_id {
                    // closes the window between the history fetch and the subscription
                    self.reconcile().await?;
                }
            }
            ServerEvent::ConversationCreated(conversation) => {
                debug!(conversation = %conversation.id, "conversation created");
            }
            ServerEvent::Error(body) => {
                warn!(code = %body.error, "relay reported: {}", body.message);
                let err = CoreError::from_relay(&body.error, &body.message);
                if self.pending_sends > 0 && !matches!(err, CoreError::Unauthorized | CoreError::Relay) {
                    self.pending_sends -= 1;
                    return Err(CoreError::Rejected(body.message));
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn apply_message(&mut self, message: &MessageView) {
        if !self.seen.insert(message.id) {
            return;
        }
        if let Some(key) = &self.session_key {
            self.visible.push(decrypt_one(key, message));
        }
    }

    /// Refetch history and rebuild the visible list from it.
    pub async fn reconcile(&mut self) -> Result<(), CoreError> {
        self.expect_phase(Phase::Live, "reconcile")?;
        let key = self
            .session_key
            .clone()
            .ok_or_else(|| CoreError::InvalidOperation("no session key".to_string()))?;
        let history = self.api.history(self.conversation_id).await?;
        let rebuilt = decrypt_all(key, history).await?;

        let before = self.visible.len();
        self.seen = rebuilt.iter().map(|m| m.id).collect();
        self.visible = rebuilt;
        if self.visible.len() != before {
            debug!(before, after = self.visible.len(), "history reconciled");
        }
        Ok(())
    }

    async fn recover(&mut self) -> Result<(), CoreError> {
        self.connected = false;
        // anything still in flight either landed in history or is gone
        self.pending_sends = 0;
        let mut delay = RECONNECT_BASE;
        loop {
            self.session.ensure_valid()?;
            match self.channel.reconnect().await {
                Ok(()) => break,
                Err(CoreError::Transport(reason)) => {
                    warn!("reconnect failed: {}; retrying in {:?}", reason, delay);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
                Err(e) => return Err(e),
            }
        }
        self.channel.join(self.conversation_id).await?;
        self.connected = true;
        info!(conversation = %self.conversation_id, "live channel restored");
        Ok(())
    }

    /// Wait for and apply the next channel event, repairing the connection
    /// first if it was lost.
    pub async fn pump(&mut self) -> Result<(), CoreError> {
        self.expect_phase(Phase::Live, "pump")?;
        if !self.connected {
            self.recover().await?;
        }
        match self.channel.next_event().await {
            Ok(event) => self.handle_event(event).await,
            Err(CoreError::Transport(reason)) => {
                warn!("live channel lost: {}", reason);
                self.recover().await
            }
            Err(e) => Err(e),
        }
    }

    /// Process events until `shutdown` flips to true (or its sender goes
    /// away), then close.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        self.expect_phase(Phase::Live, "run")?;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                result = self.pump() => {
                    if let Err(e) = result {
                        if let CoreError::Rejected(reason) = &e {
                            warn!("message not delivered: {}", reason);
                            continue;
                        }
                        if !e.is_recoverable() {
                            self.close().await;
                            return Err(e);
                        }
                        warn!("recoverable error in live loop: {}", e);
                    }
                }
            }
        }
        self.close().await;
        Ok(())
    }

    /// Tear the conversation view down. Idempotent.
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        if self.phase == Phase::Live && self.connected {
            if let Err(e) = self.channel.leave(self.conversation_id).await {
                debug!("leave failed during close: {}", e);
            }
        }
        self.phase = Phase::Closed;
        self.session_key = None;
        self.pending_history.clear();
        info!(conversation = %self.conversation_id, "conversation closed");
    }
}

fn decrypt_one(key: &SessionKey, message: &MessageView) -> DisplayMessage {
    let body = match key.open_text(&message.nonce, &message.ciphertext) {
        Ok(text) => MessageBody::Text(text),
        Err(_) => {
            warn!(message = %message.id, "message failed authentication");
            MessageBody::Undecryptable
        }
    };
    DisplayMessage {
        id: message.id,
        sender: message.sender.clone(),
        created_at: message.created_at,
        body,
    }
}

/// Decrypt a batch off the async runtime; the whole batch completes before
/// the caller sees any of it.
async fn decrypt_all(key: SessionKey, history: Vec<MessageView>) -> Result<Vec<DisplayMessage>, CoreError> {
    let decrypted = tokio::task::spawn_blocking(move || {
        history
            .iter()
            .map(|m| decrypt_one(&key, m))
            .collect::<Vec<_>>()
    })
    .await?;
    Ok(decrypted)
}
