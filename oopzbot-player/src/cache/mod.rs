//! Cache Layer
//!
//! Content-addressed store of resolved tracks keyed by [`TrackId`]. A miss
//! runs the external resolver under a per-attempt timeout with bounded
//! retries; concurrent misses for the same key share one in-flight
//! resolution.
//!
//! `use_count` moves once per logical playback: one bump per
//! [`TrackCache::get_or_resolve`] (a play request), or one
//! [`TrackCache::mark_played`] for a track that was warmed by
//! [`TrackCache::prefetch`]. Prefetching and refreshing an expired URL of a
//! track already playing never count.

pub mod metadata;
pub mod resolver;

pub use metadata::{DailyStatistics, MemoryMetadataStore, MetadataStore, PlayRecord, SqliteMetadataStore};
pub use resolver::{NeteaseResolver, TrackResolver};

use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use futures::future::{BoxFuture, FutureExt, Shared};
use oopzbot_common::{CacheEntry, ResolvedTrack, Track, TrackId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Outcome of one shared resolution
#[derive(Debug, Clone)]
struct Resolution {
    resolved: ResolvedTrack,
    /// Found in the store once registered; the resolver was not called
    cached: bool,
}

type SharedResolution = Shared<BoxFuture<'static, std::result::Result<Resolution, Arc<Error>>>>;

struct InFlightEntry {
    future: SharedResolution,
    /// Bypasses the store (refresh)
    fresh: bool,
}

type InFlight = Arc<Mutex<HashMap<TrackId, InFlightEntry>>>;

pub struct TrackCache {
    resolver: Arc<dyn TrackResolver>,
    metadata: Arc<dyn MetadataStore>,
    policy: RetryPolicy,
    /// 0 = unbounded
    max_entries: usize,
    in_flight: InFlight,
}

impl TrackCache {
    pub fn new(
        resolver: Arc<dyn TrackResolver>,
        metadata: Arc<dyn MetadataStore>,
        policy: RetryPolicy,
        max_entries: usize,
    ) -> Self {
        Self {
            resolver,
            metadata,
            policy,
            max_entries,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Resolved payload for `track`, resolving on a miss. Counts one use.
    pub async fn get_or_resolve(&self, track: &Track) -> Result<ResolvedTrack> {
        if let Some(entry) = self.lookup(&track.id).await {
            self.count_use(&track.id, true).await;
            return Ok(entry.payload);
        }

        let resolution = self.resolve_shared(track, false).await?;
        self.count_use(&track.id, resolution.cached).await;
        Ok(resolution.resolved)
    }

    /// Resolve and store without counting a use
    pub async fn prefetch(&self, track: &Track) -> Result<ResolvedTrack> {
        if let Some(entry) = self.lookup(&track.id).await {
            return Ok(entry.payload);
        }
        Ok(self.resolve_shared(track, false).await?.resolved)
    }

    /// Force a fresh resolution (expired audio URL) for a track that is
    /// already playing; does not count a use
    pub async fn refresh(&self, track: &Track) -> Result<ResolvedTrack> {
        Ok(self.resolve_shared(track, true).await?.resolved)
    }

    /// Count a playback of an already cached entry (a prefetched track that
    /// started without going through [`TrackCache::get_or_resolve`])
    pub async fn mark_played(&self, key: &TrackId) {
        self.count_use(key, true).await;
    }

    pub async fn entry(&self, key: &TrackId) -> Result<Option<CacheEntry>> {
        self.metadata.get(key).await
    }

    /// Explicit LRU eviction down to `keep` entries
    pub async fn evict_lru(&self, keep: usize) -> Result<usize> {
        let evicted = self.metadata.evict_lru(keep).await?;
        if evicted > 0 {
            debug!(evicted, keep, "Evicted least recently used cache entries");
        }
        Ok(evicted)
    }

    async fn lookup(&self, key: &TrackId) -> Option<CacheEntry> {
        match self.metadata.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                // Treat as a miss; resolution still works without the store
                warn!(track = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn count_use(&self, key: &TrackId, hit: bool) {
        if let Err(e) = self.metadata.increment_use_count(key).await {
            warn!(track = %key, error = %e, "Failed to bump cache use count");
        }
        if let Err(e) = self.metadata.record_lookup(hit).await {
            debug!(error = %e, "Failed to record cache statistics");
        }
    }

    /// Apply the capacity policy after a new entry landed
    async fn enforce_capacity(&self) {
        if self.max_entries == 0 {
            return;
        }
        if let Err(e) = self.evict_lru(self.max_entries).await {
            warn!(error = %e, "Cache eviction failed");
        }
    }

    /// Join the in-flight resolution for `track`, or start one.
    ///
    /// A `fresh` caller never takes a stored payload: it waits out a plain
    /// lookup in flight and then resolves again.
    async fn resolve_shared(&self, track: &Track, fresh: bool) -> Result<Resolution> {
        let key = track.id.clone();

        loop {
            let (future, outdated) = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
                match in_flight.get(&key) {
                    Some(existing) => {
                        debug!(track = %key, "Joining in-flight resolution");
                        (existing.future.clone(), fresh && !existing.fresh)
                    }
                    None => {
                        let future = self.spawn_resolution(track.clone(), fresh);
                        in_flight.insert(
                            key.clone(),
                            InFlightEntry {
                                future: future.clone(),
                                fresh,
                            },
                        );
                        (future, false)
                    }
                }
            };

            let result = future.await;
            if outdated {
                continue;
            }
            let resolution = result.map_err(|e| shared_error(&key, &e))?;
            if !resolution.cached {
                self.enforce_capacity().await;
            }
            return Ok(resolution);
        }
    }

    fn spawn_resolution(&self, track: Track, fresh: bool) -> SharedResolution {
        let resolver = Arc::clone(&self.resolver);
        let metadata = Arc::clone(&self.metadata);
        let in_flight = Arc::clone(&self.in_flight);
        let policy = self.policy.clone();
        let key = track.id.clone();

        // Runs to completion even if every waiter goes away, so a prefetch
        // nobody awaits still lands in the cache
        let task = tokio::spawn(async move {
            // Another caller may have stored the entry between our lookup and
            // this registration
            let stored = if fresh {
                None
            } else {
                metadata.get(&key).await.unwrap_or_else(|e| {
                    warn!(track = %key, error = %e, "Cache lookup failed");
                    None
                })
            };

            let result = match stored {
                Some(entry) => {
                    debug!(track = %key, "Resolved by a concurrent caller");
                    Ok(Resolution {
                        resolved: entry.payload,
                        cached: true,
                    })
                }
                None => {
                    let timeout_key = key.to_string();
                    let resolved = retry_with_backoff(
                        "resolve_track",
                        &policy,
                        |timeout| Error::ResolutionTimeout {
                            track: timeout_key.clone(),
                            timeout,
                        },
                        |attempt| {
                            let resolver = Arc::clone(&resolver);
                            let track = track.clone();
                            async move {
                                debug!(track = %track.id, attempt, "Resolution attempt");
                                resolver.resolve(&track).await
                            }
                        },
                    )
                    .await;

                    if let Ok(resolved) = &resolved {
                        if let Err(e) = metadata.put(resolved).await {
                            warn!(track = %key, error = %e, "Failed to store resolved track");
                        }
                    }
                    resolved.map(|resolved| Resolution {
                        resolved,
                        cached: false,
                    })
                }
            };

            // Stored before unregistering, so a late caller finds the entry
            in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&key);

            result.map_err(Arc::new)
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(Arc::new(Error::Internal(format!(
                    "resolution task failed: {}",
                    join_error
                )))),
            }
        }
        .boxed()
        .shared()
    }
}

/// Rebuild an owned error for one waiter of a shared resolution
fn shared_error(key: &TrackId, error: &Error) -> Error {
    match error {
        Error::ResolutionTimeout { track, timeout } => Error::ResolutionTimeout {
            track: track.clone(),
            timeout: *timeout,
        },
        Error::ResolutionFailed { track, reason } => Error::ResolutionFailed {
            track: track.clone(),
            reason: reason.clone(),
        },
        other => Error::resolution_failed(key, other),
    }
}
