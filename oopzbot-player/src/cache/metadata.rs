//! Persistent metadata store
//!
//! Backs the cache layer (resolved payloads + usage counters) and keeps the
//! play history and daily statistics.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oopzbot_common::{CacheEntry, ResolvedTrack, TrackId};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// One row of the daily statistics table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStatistics {
    pub date: String,
    pub total_plays: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Plays per platform
    pub platform_breakdown: BTreeMap<String, u64>,
}

impl DailyStatistics {
    fn empty(date: &str) -> Self {
        Self {
            date: date.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayRecord {
    pub track_id: TrackId,
    pub requester: Option<String>,
    pub played_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &TrackId) -> Result<Option<CacheEntry>>;

    /// Insert or replace the payload for `payload.track.id`.
    /// Keeps an existing entry's use_count.
    async fn put(&self, payload: &ResolvedTrack) -> Result<CacheEntry>;

    /// Bump use_count and last_used_at; returns the new count
    /// (`None` when the key is not cached)
    async fn increment_use_count(&self, key: &TrackId) -> Result<Option<u64>>;

    /// Delete least-recently-used entries until at most `keep` remain;
    /// returns how many were deleted
    async fn evict_lru(&self, keep: usize) -> Result<usize>;

    async fn len(&self) -> Result<usize>;

    /// Count a cache hit or miss in today's statistics
    async fn record_lookup(&self, hit: bool) -> Result<()>;

    /// Append to the play history and count the play in today's statistics
    async fn record_play(&self, track: &TrackId, requester: Option<&str>) -> Result<()>;

    async fn statistics(&self, date: &str) -> Result<Option<DailyStatistics>>;

    /// Most recent plays first
    async fn recent_plays(&self, limit: usize) -> Result<Vec<PlayRecord>>;
}

/// SQLite implementation over the `track_cache`, `play_history` and
/// `statistics` tables
pub struct SqliteMetadataStore {
    db: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    async fn ensure_statistics_row(&self, date: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO statistics (date) VALUES (?)")
            .bind(date)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get(&self, key: &TrackId) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT payload_json, use_count, created_at, last_used_at
             FROM track_cache WHERE track_id = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload_json: String = row.get("payload_json");
        let use_count: i64 = row.get("use_count");
        Ok(Some(CacheEntry {
            key: key.clone(),
            payload: serde_json::from_str(&payload_json)?,
            use_count: use_count.max(0) as u64,
            created_at: row.get("created_at"),
            last_used_at: row.get("last_used_at"),
        }))
    }

    async fn put(&self, payload: &ResolvedTrack) -> Result<CacheEntry> {
        let key = &payload.track.id;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO track_cache
                (track_id, platform, title, artist, payload_json, use_count, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(track_id) DO UPDATE SET
                title = excluded.title,
                artist = excluded.artist,
                payload_json = excluded.payload_json,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(key.as_str())
        .bind(key.platform())
        .bind(&payload.track.title)
        .bind(&payload.track.artist)
        .bind(serde_json::to_string(payload)?)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        self.get(key)
            .await?
            .ok_or_else(|| crate::error::Error::Internal(format!("cache row for {} vanished", key)))
    }

    async fn increment_use_count(&self, key: &TrackId) -> Result<Option<u64>> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE track_cache SET use_count = use_count + 1, last_used_at = ?
             WHERE track_id = ? RETURNING use_count",
        )
        .bind(Utc::now())
        .bind(key.as_str())
        .fetch_optional(&self.db)
        .await?;

        Ok(count.map(|c| c.max(0) as u64))
    }

    async fn evict_lru(&self, keep: usize) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM track_cache WHERE track_id IN (
                SELECT track_id FROM track_cache
                ORDER BY last_used_at DESC
                LIMIT -1 OFFSET ?
            )",
        )
        .bind(keep as i64)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM track_cache")
            .fetch_one(&self.db)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn record_lookup(&self, hit: bool) -> Result<()> {
        let date = oopzbot_common::time::today();
        self.ensure_statistics_row(&date).await?;

        let sql = if hit {
            "UPDATE statistics SET cache_hits = cache_hits + 1 WHERE date = ?"
        } else {
            "UPDATE statistics SET cache_misses = cache_misses + 1 WHERE date = ?"
        };
        sqlx::query(sql).bind(&date).execute(&self.db).await?;
        Ok(())
    }

    async fn record_play(&self, track: &TrackId, requester: Option<&str>) -> Result<()> {
        let date = oopzbot_common::time::today();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO play_history (track_id, platform, requester, played_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(track.as_str())
        .bind(track.platform())
        .bind(requester)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO statistics (date) VALUES (?)")
            .bind(&date)
            .execute(&mut *tx)
            .await?;

        let breakdown_json: String =
            sqlx::query_scalar("SELECT platform_breakdown FROM statistics WHERE date = ?")
                .bind(&date)
                .fetch_one(&mut *tx)
                .await?;
        let mut breakdown: BTreeMap<String, u64> =
            serde_json::from_str(&breakdown_json).unwrap_or_default();
        *breakdown.entry(track.platform().to_string()).or_insert(0) += 1;

        sqlx::query(
            "UPDATE statistics SET total_plays = total_plays + 1, platform_breakdown = ?
             WHERE date = ?",
        )
        .bind(serde_json::to_string(&breakdown)?)
        .bind(&date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn statistics(&self, date: &str) -> Result<Option<DailyStatistics>> {
        let row = sqlx::query(
            "SELECT total_plays, cache_hits, cache_misses, platform_breakdown
             FROM statistics WHERE date = ?",
        )
        .bind(date)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| {
            let breakdown: String = row.get("platform_breakdown");
            DailyStatistics {
                date: date.to_string(),
                total_plays: row.get::<i64, _>("total_plays").max(0) as u64,
                cache_hits: row.get::<i64, _>("cache_hits").max(0) as u64,
                cache_misses: row.get::<i64, _>("cache_misses").max(0) as u64,
                platform_breakdown: serde_json::from_str(&breakdown).unwrap_or_default(),
            }
        }))
    }

    async fn recent_plays(&self, limit: usize) -> Result<Vec<PlayRecord>> {
        let rows = sqlx::query(
            "SELECT track_id, requester, played_at FROM play_history
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        let mut plays = Vec::with_capacity(rows.len());
        for row in rows {
            let track_id: String = row.get("track_id");
            let Some(track_id) = TrackId::parse(&track_id) else {
                continue;
            };
            plays.push(PlayRecord {
                track_id,
                requester: row.get("requester"),
                played_at: row.get("played_at"),
            });
        }
        Ok(plays)
    }
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<TrackId, (CacheEntry, u64)>,
    /// Recency sequence; breaks last_used_at ties deterministically
    seq: u64,
    history: Vec<PlayRecord>,
    statistics: HashMap<String, DailyStatistics>,
}

/// In-process implementation; nothing survives a restart
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &TrackId) -> Result<Option<CacheEntry>> {
        Ok(self.lock().entries.get(key).map(|(e, _)| e.clone()))
    }

    async fn put(&self, payload: &ResolvedTrack) -> Result<CacheEntry> {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let now = Utc::now();

        let entry = match inner.entries.remove(&payload.track.id) {
            Some((mut existing, _)) => {
                existing.payload = payload.clone();
                existing.last_used_at = now;
                existing
            }
            None => CacheEntry {
                key: payload.track.id.clone(),
                payload: payload.clone(),
                use_count: 0,
                created_at: now,
                last_used_at: now,
            },
        };
        inner.entries.insert(entry.key.clone(), (entry.clone(), seq));
        Ok(entry)
    }

    async fn increment_use_count(&self, key: &TrackId) -> Result<Option<u64>> {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        Ok(inner.entries.get_mut(key).map(|(entry, entry_seq)| {
            entry.use_count += 1;
            entry.last_used_at = Utc::now();
            *entry_seq = seq;
            entry.use_count
        }))
    }

    async fn evict_lru(&self, keep: usize) -> Result<usize> {
        let mut inner = self.lock();
        if inner.entries.len() <= keep {
            return Ok(0);
        }

        let mut by_recency: Vec<(u64, TrackId)> = inner
            .entries
            .iter()
            .map(|(key, (_, seq))| (*seq, key.clone()))
            .collect();
        by_recency.sort();

        let excess = inner.entries.len() - keep;
        for (_, key) in by_recency.into_iter().take(excess) {
            inner.entries.remove(&key);
        }
        Ok(excess)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().entries.len())
    }

    async fn record_lookup(&self, hit: bool) -> Result<()> {
        let date = oopzbot_common::time::today();
        let mut inner = self.lock();
        let stats = inner
            .statistics
            .entry(date.clone())
            .or_insert_with(|| DailyStatistics::empty(&date));
        if hit {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
        }
        Ok(())
    }

    async fn record_play(&self, track: &TrackId, requester: Option<&str>) -> Result<()> {
        let date = oopzbot_common::time::today();
        let mut inner = self.lock();
        inner.history.push(PlayRecord {
            track_id: track.clone(),
            requester: requester.map(str::to_string),
            played_at: Utc::now(),
        });
        let stats = inner
            .statistics
            .entry(date.clone())
            .or_insert_with(|| DailyStatistics::empty(&date));
        stats.total_plays += 1;
        *stats
            .platform_breakdown
            .entry(track.platform().to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn statistics(&self, date: &str) -> Result<Option<DailyStatistics>> {
        Ok(self.lock().statistics.get(date).cloned())
    }

    async fn recent_plays(&self, limit: usize) -> Result<Vec<PlayRecord>> {
        Ok(self.lock().history.iter().rev().take(limit).cloned().collect())
    }
}
