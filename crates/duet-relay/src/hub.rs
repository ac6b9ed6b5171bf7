//! Channel hub: which live connection listens to which channel.
//!
//! Every connection owns a bounded outbound queue. Broadcasts never wait
//! on a slow reader; a full or closed queue loses that push.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use duet_proto::{ConversationId, ServerEvent, UserId};

use crate::metrics::RelayMetrics;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Personal channel, joined implicitly at handshake.
    User(UserId),
    Conversation(ConversationId),
}

struct ConnectionEntry {
    user: UserId,
    tx: mpsc::Sender<ServerEvent>,
    channels: HashSet<Channel>,
}

pub struct ChannelHub {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    channels: DashMap<Channel, HashSet<ConnectionId>>,
    queue_len: usize,
    metrics: Arc<RelayMetrics>,
}

impl ChannelHub {
    pub fn new(queue_len: usize, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
            channels: DashMap::new(),
            queue_len,
            metrics,
        }
    }

    /// Register a connection for `user`, already subscribed to its personal
    /// channel.
    pub fn register(&self, user: UserId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_len);
        self.connections.insert(
            id,
            ConnectionEntry {
                user,
                tx,
                channels: HashSet::new(),
            },
        );
        self.subscribe(id, Channel::User(user));
        self.metrics.active_connections.set(self.connections.len() as f64);
        (id, rx)
    }

    pub fn subscribe(&self, id: ConnectionId, channel: Channel) {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                entry.channels.insert(channel);
            }
            None => return,
        }
        self.channels.entry(channel).or_default().insert(id);
    }

    pub fn unsubscribe(&self, id: ConnectionId, channel: Channel) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.channels.remove(&channel);
        }
        self.detach(id, channel);
    }

    /// Drop a connection from every channel it joined.
    pub fn remove(&self, id: ConnectionId) {
        if let Some((_, entry)) = self.connections.remove(&id) {
            for channel in entry.channels {
                self.detach(id, channel);
            }
        }
        self.metrics.active_connections.set(self.connections.len() as f64);
    }

    fn detach(&self, id: ConnectionId, channel: Channel) {
        let now_empty = match self.channels.get_mut(&channel) {
            Some(mut members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.channels.remove_if(&channel, |_, members| members.is_empty());
        }
    }

    /// Queue `event` to every subscriber of `channel`. Returns how many
    /// connections accepted it.
    pub fn broadcast(&self, channel: Channel, event: &ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = match self.channels.get(&channel) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in targets {
            let tx = match self.connections.get(&id) {
                Some(entry) => entry.tx.clone(),
                None => continue,
            };
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.pushes_delivered.inc();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = id, ?channel, "outbound queue full, push dropped");
                    self.metrics.pushes_dropped.inc();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection = id, "connection closed, push dropped");
                    self.metrics.pushes_dropped.inc();
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections_of(&self, user: UserId) -> usize {
        self.connections.iter().filter(|e| e.user == user).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_proto::events::ConversationRef;

    fn hub(queue_len: usize) -> ChannelHub {
        ChannelHub::new(queue_len, Arc::new(RelayMetrics::new().unwrap()))
    }

    fn joined(id: ConversationId) -> ServerEvent {
        ServerEvent::Joined(ConversationRef { conversation_id: id })
    }

    #[tokio::test]
    async fn only_subscribers_receive() {
        let hub = hub(8);
        let conv = ConversationId::new();
        let (a, mut rx_a) = hub.register(UserId::new());
        let (_b, mut rx_b) = hub.register(UserId::new());
        hub.subscribe(a, Channel::Conversation(conv));

        assert_eq!(hub.broadcast(Channel::Conversation(conv), &joined(conv)), 1);
        assert_eq!(rx_a.recv().await, Some(joined(conv)));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn personal_channel_is_implicit() {
        let hub = hub(8);
        let user = UserId::new();
        let (_id, mut rx) = hub.register(user);
        let conv = ConversationId::new();
        assert_eq!(hub.broadcast(Channel::User(user), &joined(conv)), 1);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let hub = hub(1);
        let conv = ConversationId::new();
        let (a, _rx) = hub.register(UserId::new());
        hub.subscribe(a, Channel::Conversation(conv));

        assert_eq!(hub.broadcast(Channel::Conversation(conv), &joined(conv)), 1);
        assert_eq!(hub.broadcast(Channel::Conversation(conv), &joined(conv)), 0);
        assert_eq!(hub.metrics.pushes_dropped.get(), 1.0);
    }

    #[test]
    fn remove_leaves_every_channel() {
        let hub = hub(4);
        let user = UserId::new();
        let conv = ConversationId::new();
        let (a, _rx) = hub.register(user);
        hub.subscribe(a, Channel::Conversation(conv));
        assert_eq!(hub.connections_of(user), 1);

        hub.remove(a);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.broadcast(Channel::Conversation(conv), &joined(conv)), 0);
        assert_eq!(hub.broadcast(Channel::User(user), &joined(conv)), 0);
        assert!(hub.channels.is_empty());
    }

    #[test]
    fn unsubscribe_stops_pushes() {
        let hub = hub(4);
        let conv = ConversationId::new();
        let (a, _rx) = hub.register(UserId::new());
        hub.subscribe(a, Channel::Conversation(conv));
        hub.unsubscribe(a, Channel::Conversation(conv));
        assert_eq!(hub.broadcast(Channel::Conversation(conv), &joined(conv)), 0);
    }
}
