//! Queue Store
//!
//! Ordered sequence of pending tracks plus the pointer to the current track.
//! One async mutex guards the whole store, so every mutation is atomic with
//! respect to concurrent callers. With a database pool attached, each
//! mutation is written through to the `queue` table before the in-memory
//! sequence changes; a failed write leaves the store untouched.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use oopzbot_common::{QueueEntry, ResolvedTrack, Track};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Document published under the `current` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentTrack {
    pub entry_id: Uuid,
    pub track: Track,
    pub resolved: ResolvedTrack,
    pub requester: String,
    pub started_at: DateTime<Utc>,
}

impl CurrentTrack {
    pub fn new(entry: QueueEntry, resolved: ResolvedTrack) -> Self {
        Self {
            entry_id: entry.entry_id,
            track: entry.track,
            resolved,
            requester: entry.requester,
            started_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    current: Option<CurrentTrack>,
    next_order: i64,
}

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct QueueStore {
    inner: Mutex<QueueInner>,
    db: Option<SqlitePool>,
    write_timeout: Duration,
}

impl QueueStore {
    /// Empty, memory-only store
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_order: 1,
                ..Default::default()
            }),
            db: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Load pending entries from the `queue` table, ordered by play_order,
    /// and keep writing through to it.
    pub async fn load(db: SqlitePool) -> Result<Self> {
        let rows = sqlx::query(
            "SELECT entry_id, play_order, track_json, requester, enqueued_at
             FROM queue ORDER BY play_order ASC",
        )
        .fetch_all(&db)
        .await?;

        let mut entries = VecDeque::with_capacity(rows.len());
        for row in rows {
            let entry_id: String = row.get("entry_id");
            let track_json: String = row.get("track_json");
            entries.push_back(QueueEntry {
                entry_id: Uuid::parse_str(&entry_id)
                    .map_err(|e| Error::Internal(format!("Invalid queue entry UUID: {}", e)))?,
                track: serde_json::from_str(&track_json)?,
                play_order: row.get("play_order"),
                requester: row.get("requester"),
                enqueued_at: row.get("enqueued_at"),
            });
        }

        let next_order = entries.iter().map(|e| e.play_order).max().unwrap_or(0) + 1;
        info!("Loaded {} queue entries from database", entries.len());

        Ok(Self {
            inner: Mutex::new(QueueInner {
                entries,
                current: None,
                next_order,
            }),
            db: Some(db),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Bound every write-through to `timeout`
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Append a track; returns its 1-based position in the queue
    pub async fn enqueue(&self, track: Track, requester: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let entry = QueueEntry::new(track, requester, inner.next_order);

        if let Some(db) = &self.db {
            let track_json = serde_json::to_string(&entry.track)?;
            let insert = sqlx::query(
                "INSERT INTO queue (entry_id, play_order, track_json, requester, enqueued_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entry.entry_id.to_string())
            .bind(entry.play_order)
            .bind(track_json)
            .bind(&entry.requester)
            .bind(entry.enqueued_at)
            .execute(db);
            self.persist("insert", insert).await?;
        }

        debug!(track = %entry.track.id, requester, "Enqueued");
        inner.next_order += 1;
        inner.entries.push_back(entry);
        Ok(inner.entries.len())
    }

    /// Remove and return the head of the queue
    pub async fn dequeue_next(&self) -> Result<Option<QueueEntry>> {
        let mut inner = self.inner.lock().await;
        let Some(head) = inner.entries.front() else {
            return Ok(None);
        };
        self.delete_row(head.entry_id).await?;
        Ok(inner.entries.pop_front())
    }

    /// Pending entries in play order
    pub async fn peek(&self) -> Vec<QueueEntry> {
        self.inner.lock().await.entries.iter().cloned().collect()
    }

    /// Head of the queue without removing it
    pub async fn peek_next(&self) -> Option<QueueEntry> {
        self.inner.lock().await.entries.front().cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Remove the entry at `index` (0-based)
    pub async fn remove(&self, index: usize) -> Result<QueueEntry> {
        let mut inner = self.inner.lock().await;
        let len = inner.entries.len();
        let entry_id = inner
            .entries
            .get(index)
            .map(|e| e.entry_id)
            .ok_or(Error::QueueIndexInvalid { index, len })?;

        self.delete_row(entry_id).await?;
        inner
            .entries
            .remove(index)
            .ok_or(Error::QueueIndexInvalid { index, len })
    }

    /// Move the entry at `index` to the head of the queue
    pub async fn promote(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let len = inner.entries.len();
        if index >= len {
            return Err(Error::QueueIndexInvalid { index, len });
        }
        if index == 0 {
            return Ok(());
        }

        let head_order = inner.entries.front().map(|e| e.play_order).unwrap_or(0);
        let new_order = head_order - 1;
        let entry_id = inner.entries[index].entry_id;

        if let Some(db) = &self.db {
            let update = sqlx::query("UPDATE queue SET play_order = ? WHERE entry_id = ?")
                .bind(new_order)
                .bind(entry_id.to_string())
                .execute(db);
            self.persist("reorder", update).await?;
        }

        if let Some(mut entry) = inner.entries.remove(index) {
            entry.play_order = new_order;
            inner.entries.push_front(entry);
        }
        Ok(())
    }

    /// Drop every pending entry; returns how many were removed
    pub async fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if let Some(db) = &self.db {
            self.persist("clear", sqlx::query("DELETE FROM queue").execute(db))
                .await?;
        }
        let removed = inner.entries.len();
        inner.entries.clear();
        Ok(removed)
    }

    /// The track playing now, as last set by the controller
    pub async fn current(&self) -> Option<CurrentTrack> {
        self.inner.lock().await.current.clone()
    }

    pub async fn set_current(&self, current: CurrentTrack) {
        self.inner.lock().await.current = Some(current);
    }

    pub async fn clear_current(&self) -> Option<CurrentTrack> {
        self.inner.lock().await.current.take()
    }

    async fn delete_row(&self, entry_id: Uuid) -> Result<()> {
        if let Some(db) = &self.db {
            let delete = sqlx::query("DELETE FROM queue WHERE entry_id = ?")
                .bind(entry_id.to_string())
                .execute(db);
            self.persist("delete", delete).await?;
        }
        Ok(())
    }

    async fn persist<T>(
        &self,
        what: &str,
        write: impl Future<Output = std::result::Result<T, sqlx::Error>>,
    ) -> Result<()> {
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(Error::StoreWriteFailed(format!(
                "queue {} timed out after {:?}",
                what, self.write_timeout
            ))),
        }
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}
