//! Data model shared by the playback core and its surfaces
//!
//! Every type here serializes to the JSON documents stored under the shared
//! state store keys (`current`, `queue`, `play_state`), so field names are part
//! of the external interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Track identity, `<platform>:<source id>` (e.g. `netease:186016`)
///
/// Also the content key of the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(platform: &str, source_id: impl fmt::Display) -> Self {
        Self(format!("{}:{}", platform, source_id))
    }

    /// Parse a `<platform>:<id>` string; a bare id is assumed to be netease.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once(':') {
            Some((platform, id)) if !platform.is_empty() && !id.is_empty() => {
                Some(Self(raw.to_string()))
            }
            Some(_) => None,
            None => Some(Self::new("netease", raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn platform(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or("")
    }

    pub fn source_id(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or(&self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A playable audio item with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    /// Duration in milliseconds (0 when the provider did not report one)
    #[serde(default)]
    pub duration_ms: u64,
    /// Cover image reference
    #[serde(default)]
    pub cover: Option<String>,
    /// Resolved audio reference, filled in once the track has been resolved
    #[serde(default)]
    pub audio_url: Option<String>,
}

impl Track {
    pub fn new(id: TrackId, title: impl Into<String>, artist: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id,
            title: title.into(),
            artist: artist.into(),
            album: String::new(),
            duration_ms,
            cover: None,
            audio_url: None,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }

    /// Duration as `m:ss`
    pub fn duration_text(&self) -> String {
        let s = self.duration_ms / 1000;
        format!("{}:{:02}", s / 60, s % 60)
    }
}

/// Output of a successful resolution: everything needed to stream a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTrack {
    /// Track metadata as reported by the provider, `audio_url` filled in
    pub track: Track,
    pub audio_url: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub lyric: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedTrack {
    pub fn new(mut track: Track, audio_url: impl Into<String>) -> Self {
        let audio_url = audio_url.into();
        track.audio_url = Some(audio_url.clone());
        let cover_url = track.cover.clone();
        Self {
            track,
            audio_url,
            cover_url,
            lyric: None,
            resolved_at: Utc::now(),
        }
    }
}

/// A pending track in the play queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry_id: Uuid,
    pub track: Track,
    /// Monotonic enqueue order; lower plays first unless promoted
    pub play_order: i64,
    /// Identity of the user (or surface) that requested the track
    pub requester: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(track: Track, requester: impl Into<String>, play_order: i64) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            track,
            play_order,
            requester: requester.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Cached resolution of a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: TrackId,
    pub payload: ResolvedTrack,
    pub use_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Canonical playback state published under the `play_state` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayState {
    /// Current track, `None` once the state has been cleared
    pub track_id: Option<TrackId>,
    /// Effective start, wall-clock epoch seconds (now - elapsed)
    pub start_time: f64,
    /// Track duration in seconds
    pub duration: f64,
    pub paused: bool,
    /// Elapsed seconds at the moment of pausing; only set while paused
    pub pause_elapsed: Option<f64>,
    /// 0-100
    pub volume: u8,
    pub revision: u64,
}

impl PlayState {
    /// A cleared state: nothing playing
    pub fn cleared(volume: u8, revision: u64) -> Self {
        Self {
            track_id: None,
            start_time: 0.0,
            duration: 0.0,
            paused: false,
            pause_elapsed: None,
            volume,
            revision,
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.track_id.is_none()
    }

    /// Elapsed playback seconds as seen at `now` (epoch seconds)
    pub fn elapsed_at(&self, now: f64) -> f64 {
        if self.is_cleared() {
            return 0.0;
        }
        match (self.paused, self.pause_elapsed) {
            (true, Some(elapsed)) => elapsed,
            _ => (now - self.start_time).clamp(0.0, self.duration.max(0.0)),
        }
    }
}

/// Category of a NOTIFY payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A queue entry was skipped because it could not be resolved
    Skipped,
    /// No actuator backend could be initialized; audio is muted
    Degraded,
    /// Audio came back after a degraded period
    Recovered,
    /// The active actuator backend failed and another one took over
    FailedOver,
    NowPlaying,
    /// A track was queued from the web control surface
    WebEnqueue,
    #[serde(other)]
    Other,
}

/// Payload carried by a NOTIFY command, delivered to the chat transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Interpret an arbitrary NOTIFY payload.
    ///
    /// Accepts a serialized `Notification`, or the web surface's enqueue
    /// announcement (`{"name", "artists", "position"}`); anything else is
    /// carried verbatim as `Other`.
    pub fn from_payload(value: serde_json::Value) -> Self {
        if let Ok(notification) = serde_json::from_value::<Notification>(value.clone()) {
            return notification;
        }
        if let Some(name) = value.get("name").and_then(|v| v.as_str()) {
            let artists = value
                .get("artists")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let position = value
                .get("position")
                .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));
            let message = match position {
                Some(pos) => format!("[Web] {} - {} queued (position {})", name, artists, pos),
                None => format!("[Web] {} - {} queued", name, artists),
            };
            return Self::new(NotificationKind::WebEnqueue, message).with_payload(value);
        }
        Self::new(NotificationKind::Other, value.to_string()).with_payload(value)
    }
}
