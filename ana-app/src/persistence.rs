//! Durable exchange log. Append-only: one row per inbound and one per
//! outbound message, tagged with the resolved intent.

use crate::intent::Intent;
use ana_channels::UserKey;
use ana_llm::Role;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn append_exchange(
        &self,
        user_key: &UserKey,
        role: Role,
        content: &str,
        intent: Intent,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteExchangeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExchangeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open exchange db {}", path.as_ref().display()))?;
        conn.execute(
            r#"
CREATE TABLE IF NOT EXISTS exchanges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_key TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    intent TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#,
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn count_for(&self, user_key: &UserKey) -> Result<u64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("exchange db lock poisoned"))?;
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM exchanges WHERE user_key = ?1",
            params![user_key.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[async_trait]
impl ExchangeStore for SqliteExchangeStore {
    async fn append_exchange(
        &self,
        user_key: &UserKey,
        role: Role,
        content: &str,
        intent: Intent,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let user_key = user_key.clone();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("exchange db lock poisoned"))?;
            conn.execute(
                r#"
INSERT INTO exchanges (user_key, role, content, intent, created_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![
                    user_key.as_str(),
                    role.as_str(),
                    content,
                    intent.as_label(),
                    timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}
