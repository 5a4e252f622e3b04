//! SQLite-backed state store
//!
//! Documents live in `state_kv`, commands in `commands`. Other processes
//! attached to the same database file see the same state; blocking reads
//! poll at `poll_interval`.

use super::{revision_of, StateStore, KEY_PLAY_STATE};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::time::Instant;

pub struct SqliteStateStore {
    db: SqlitePool,
    poll_interval: Duration,
}

impl SqliteStateStore {
    pub fn new(db: SqlitePool, poll_interval: Duration) -> Self {
        Self { db, poll_interval }
    }

    async fn try_pop(&self) -> Result<Option<String>> {
        let body: Option<String> = sqlx::query_scalar(
            "DELETE FROM commands WHERE id = (SELECT MIN(id) FROM commands) RETURNING body",
        )
        .fetch_optional(&self.db)
        .await?;
        Ok(body)
    }

    async fn current_revision(&self) -> Result<Option<u64>> {
        Ok(self.get(KEY_PLAY_STATE).await?.as_ref().and_then(revision_of))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM state_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO state_kv (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM state_kv WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn push_command(&self, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO commands (body) VALUES (?)")
            .bind(body)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn pop_command(&self, wait: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(body) = self.try_pop().await? {
                return Ok(Some(body));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_revision(&self, after: u64, wait: Duration) -> Result<Option<u64>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(revision) = self.current_revision().await? {
                if revision > after {
                    return Ok(Some(revision));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteStateStore {
        let pool = oopzbot_common::db::init_memory_database().await.unwrap();
        SqliteStateStore::new(pool, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_documents_roundtrip() {
        let store = store().await;
        let doc = json!({"revision": 2, "paused": false});
        store.put(KEY_PLAY_STATE, &doc).await.unwrap();
        store.put(KEY_PLAY_STATE, &json!({"revision": 3})).await.unwrap();
        assert_eq!(store.get(KEY_PLAY_STATE).await.unwrap(), Some(json!({"revision": 3})));

        store.delete(KEY_PLAY_STATE).await.unwrap();
        assert!(store.get(KEY_PLAY_STATE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_is_fifo_and_at_most_once() {
        let store = store().await;
        store.push_command("pause").await.unwrap();
        store.push_command("resume").await.unwrap();

        let wait = Duration::from_millis(20);
        assert_eq!(store.pop_command(wait).await.unwrap().as_deref(), Some("pause"));
        assert_eq!(store.pop_command(wait).await.unwrap().as_deref(), Some("resume"));
        assert!(store.pop_command(wait).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_revision_sees_existing_state() {
        let store = store().await;
        store.put(KEY_PLAY_STATE, &json!({"revision": 9})).await.unwrap();
        assert_eq!(
            store.wait_revision(5, Duration::from_millis(50)).await.unwrap(),
            Some(9)
        );
        assert!(store
            .wait_revision(9, Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }
}
