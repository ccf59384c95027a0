//! SQLite persistence for conversations, messages, and running summaries.
//!
//! A [`Store`] wraps one connection pool, opened at startup and closed on
//! shutdown. Messages are ordered by `created_at` with ties broken by
//! insertion order (`rowid`). A turn's messages are written in one
//! transaction by [`Store::commit_turn`].

use std::path::Path;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::MessageRole;
use crate::error::StoreError;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        summary_up_to_index INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'tool')),
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, created_at)
    ",
];

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Records ────────────────────────────────────────────────────────

/// A conversation as listed: no summary, no messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationHeader {
    pub id: String,
    pub title: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub summary: String,
    /// Number of leading messages folded into `summary`.
    pub summary_up_to_index: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

/// Everything one completed turn writes.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub conversation_id: String,
    /// Set when the turn started a new conversation; the row is created
    /// with this title in the same transaction.
    pub new_title: Option<String>,
    /// User, tool, and assistant messages in order.
    pub messages: Vec<(MessageRole, String)>,
}

// ── Store ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.into()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("Database ready at {}", path.display());
        Ok(store)
    }

    /// A private in-memory database. One connection, so every query sees
    /// the same data.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Conversations ──

    /// All conversations, newest first.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationHeader>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, created_at FROM conversations ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ConversationHeader {
                id: r.get("id"),
                title: r.get("title"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT id, title, summary, summary_up_to_index, created_at
            FROM conversations WHERE id = ?
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Conversation {
            id: r.get("id"),
            title: r.get("title"),
            summary: r.get("summary"),
            summary_up_to_index: r.get("summary_up_to_index"),
            created_at: r.get("created_at"),
        }))
    }

    pub async fn conversation_exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            summary: String::new(),
            summary_up_to_index: 0,
            created_at: now(),
        };
        sqlx::query("INSERT INTO conversations (id, title, created_at) VALUES (?, ?, ?)")
            .bind(&conversation.id)
            .bind(&conversation.title)
            .bind(&conversation.created_at)
            .execute(&self.pool)
            .await?;
        debug!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    /// Delete a conversation and its messages. Returns `false` if it did
    /// not exist.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Messages ──

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        self.messages_from(conversation_id, 0, -1).await
    }

    /// Messages `[start, end)` in conversation order.
    pub async fn message_range(
        &self,
        conversation_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        self.messages_from(conversation_id, start, end - start).await
    }

    async fn messages_from(
        &self,
        conversation_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, conversation_id, role, content, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            ",
        )
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let role: String = r.get("role");
                Some(StoredMessage {
                    id: r.get("id"),
                    conversation_id: r.get("conversation_id"),
                    role: MessageRole::parse(&role)?,
                    content: r.get("content"),
                    created_at: r.get("created_at"),
                })
            })
            .collect())
    }

    pub async fn message_count(&self, conversation_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // ── Summaries ──

    /// Store a new summary covering the first `coverage` messages.
    ///
    /// Fails with [`StoreError::CoverageRegression`] if `coverage` is below
    /// the stored coverage; the stored row is left untouched.
    pub async fn update_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        coverage: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE conversations SET summary = ?, summary_up_to_index = ?
            WHERE id = ? AND summary_up_to_index <= ?
            ",
        )
        .bind(summary)
        .bind(coverage)
        .bind(conversation_id)
        .bind(coverage)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!("Summary for {conversation_id} now covers {coverage} message(s)");
            return Ok(());
        }
        match self.get_conversation(conversation_id).await? {
            Some(c) => Err(StoreError::CoverageRegression {
                current: c.summary_up_to_index,
                proposed: coverage,
            }),
            None => Err(StoreError::NotFound(conversation_id.to_string())),
        }
    }

    // ── Turns ──

    /// Write a completed turn in one transaction: the conversation row for
    /// new conversations, then every message in order.
    pub async fn commit_turn(&self, turn: &TurnRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        match &turn.new_title {
            Some(title) => {
                sqlx::query("INSERT INTO conversations (id, title, created_at) VALUES (?, ?, ?)")
                    .bind(&turn.conversation_id)
                    .bind(title)
                    .bind(now())
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
                    .bind(&turn.conversation_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                if exists.is_none() {
                    return Err(StoreError::NotFound(turn.conversation_id.clone()));
                }
            }
        }

        for (role, content) in &turn.messages {
            sqlx::query(
                r"
                INSERT INTO messages (id, conversation_id, role, content, created_at)
                VALUES (?, ?, ?, ?, ?)
                ",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&turn.conversation_id)
            .bind(role.as_str())
            .bind(content)
            .bind(now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Committed {} message(s) to {}",
            turn.messages.len(),
            turn.conversation_id
        );
        Ok(())
    }
}
