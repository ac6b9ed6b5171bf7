//! SQLite-backed relay storage

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use duet_proto::{
    ConversationId, ConversationView, MessageId, MessageView, PortableKey, UserId, UserSummary,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store lock poisoned")]
    Poisoned,
    #[error("Blocking task failed: {0}")]
    Task(String),
}

/// Persistence used by the key directory and the conversation relay.
///
/// Conversations are keyed by the unordered participant pair; messages are
/// append-only and come back in insertion order with non-decreasing
/// `created_at`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_user(&self, username: &str) -> Result<UserSummary, StoreError>;
    async fn get_user(&self, id: UserId) -> Result<Option<UserSummary>, StoreError>;
    async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError>;

    /// Insert or replace the key of `user`, returning the previous one.
    async fn upsert_key(&self, user: UserId, key: &PortableKey) -> Result<Option<PortableKey>, StoreError>;
    async fn get_key(&self, user: UserId) -> Result<Option<PortableKey>, StoreError>;

    /// Return the conversation of the pair, creating it if absent. The flag
    /// is true when this call created it.
    async fn create_or_get_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(ConversationView, bool), StoreError>;
    async fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationView>, StoreError>;
    /// Conversations of `user`, most recently active first.
    async fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationView>, StoreError>;

    /// Persist a message and bump the conversation's `updated_at`.
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, StoreError>;
    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageView>, StoreError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS public_keys (
    user_id TEXT PRIMARY KEY REFERENCES users(id),
    material TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_lo TEXT NOT NULL REFERENCES users(id),
    user_hi TEXT NOT NULL REFERENCES users(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (user_lo, user_hi),
    CHECK (user_lo < user_hi)
);

CREATE INDEX IF NOT EXISTS idx_conversations_lo ON conversations (user_lo, updated_at);
CREATE INDEX IF NOT EXISTS idx_conversations_hi ON conversations (user_hi, updated_at);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    sender_id TEXT NOT NULL REFERENCES users(id),
    nonce BLOB NOT NULL,
    ciphertext BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, created_at, seq);
"#;

const CONVERSATION_SELECT: &str = r#"
SELECT c.id, c.created_at, c.updated_at, c.user_lo, lo.username, c.user_hi, hi.username
FROM conversations c
JOIN users lo ON lo.id = c.user_lo
JOIN users hi ON hi.id = c.user_hi
"#;

const MESSAGE_SELECT: &str = r#"
SELECT m.id, m.conversation_id, m.sender_id, u.username, m.nonce, m.ciphertext, m.created_at
FROM messages m
JOIN users u ON u.id = m.sender_id
"#;

/// SQLite store behind a single connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store
            .with_conn(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_user(&self, username: &str) -> Result<UserSummary, StoreError> {
        let user = UserSummary {
            id: UserId::new(),
            username: username.to_string(),
        };
        let row = user.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
                params![row.id.to_string(), row.username, now_millis()],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("username {} is taken", row.username)));
            }
            Ok(())
        })
        .await?;
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<UserSummary>, StoreError> {
        self.with_conn(move |conn| {
            let username: Option<String> = conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(username.map(|username| UserSummary { id, username }))
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, username FROM users ORDER BY username")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, username)| -> Result<UserSummary, StoreError> {
                    Ok(UserSummary {
                        id: parse_id(&id)?,
                        username,
                    })
                })
                .collect()
        })
        .await
    }

    async fn upsert_key(&self, user: UserId, key: &PortableKey) -> Result<Option<PortableKey>, StoreError> {
        let material = serde_json::to_string(key)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT material FROM public_keys WHERE user_id = ?1",
                    params![user.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT INTO public_keys (user_id, material, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET material = excluded.material, updated_at = excluded.updated_at",
                params![user.to_string(), material, now_millis()],
            )?;
            tx.commit()?;
            previous
                .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn get_key(&self, user: UserId) -> Result<Option<PortableKey>, StoreError> {
        self.with_conn(move |conn| {
            let material: Option<String> = conn
                .query_row(
                    "SELECT material FROM public_keys WHERE user_id = ?1",
                    params![user.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            material
                .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn create_or_get_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(ConversationView, bool), StoreError> {
        let (lo, hi) = if a.to_string() < b.to_string() { (a, b) } else { (b, a) };
        self.with_conn(move |conn| {
            let now = now_millis();
            // the pair's UNIQUE constraint settles concurrent creators
            let created = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, user_lo, user_hi, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![ConversationId::new().to_string(), lo.to_string(), hi.to_string(), now],
            )? == 1;
            let row = conn.query_row(
                &format!("{CONVERSATION_SELECT} WHERE c.user_lo = ?1 AND c.user_hi = ?2"),
                params![lo.to_string(), hi.to_string()],
                ConversationRow::read,
            )?;
            Ok((row.into_view()?, created))
        })
        .await
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationView>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("{CONVERSATION_SELECT} WHERE c.id = ?1"),
                params![id.to_string()],
                ConversationRow::read,
            )
            .optional()?
            .map(ConversationRow::into_view)
            .transpose()
        })
        .await
    }

    async fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationView>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{CONVERSATION_SELECT} WHERE c.user_lo = ?1 OR c.user_hi = ?1 ORDER BY c.updated_at DESC, c.id"
            ))?;
            let rows = stmt
                .query_map(params![user.to_string()], ConversationRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ConversationRow::into_view).collect()
        })
        .await
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<MessageView, StoreError> {
        let id = MessageId::new();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            // never earlier than the newest message already in the conversation
            let created_at: i64 = tx.query_row(
                "SELECT MAX(?1, COALESCE(MAX(created_at), 0)) FROM messages WHERE conversation_id = ?2",
                params![now_millis(), conversation_id.to_string()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, nonce, ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    conversation_id.to_string(),
                    sender.to_string(),
                    nonce,
                    ciphertext,
                    created_at
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![created_at, conversation_id.to_string()],
            )?;
            let row = tx.query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
                params![id.to_string()],
                MessageRow::read,
            )?;
            tx.commit()?;
            row.into_view()
        })
        .await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageView>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT} WHERE m.conversation_id = ?1 ORDER BY m.created_at, m.seq"
            ))?;
            let rows = stmt
                .query_map(params![conversation_id.to_string()], MessageRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(MessageRow::into_view).collect()
        })
        .await
    }
}

struct ConversationRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    lo: (String, String),
    hi: (String, String),
}

impl ConversationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            lo: (row.get(3)?, row.get(4)?),
            hi: (row.get(5)?, row.get(6)?),
        })
    }

    fn into_view(self) -> Result<ConversationView, StoreError> {
        let participant = |(id, username): (String, String)| -> Result<UserSummary, StoreError> {
            Ok(UserSummary {
                id: parse_id(&id)?,
                username,
            })
        };
        Ok(ConversationView {
            id: parse_id(&self.id)?,
            participants: vec![participant(self.lo)?, participant(self.hi)?],
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    sender_name: String,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
    created_at: i64,
}

impl MessageRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            sender_name: row.get(3)?,
            nonce: row.get(4)?,
            ciphertext: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_view(self) -> Result<MessageView, StoreError> {
        Ok(MessageView {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender: UserSummary {
                id: parse_id(&self.sender_id)?,
                username: self.sender_name,
            },
            nonce: self.nonce,
            ciphertext: self.ciphertext,
            created_at: from_millis(self.created_at)?,
        })
    }
}

fn parse_id<T: FromStr>(raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad identifier {raw}")))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {ms}")))
}
