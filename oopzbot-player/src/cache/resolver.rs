//! Track resolution provider
//!
//! Turns a queued [`Track`] into something streamable: the audio URL plus
//! whatever metadata the provider knows better than the enqueuing surface
//! (duration, album, cover, lyric).

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use oopzbot_common::{ResolvedTrack, Track};
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = concat!("oopzbot/", env!("CARGO_PKG_VERSION"));

/// External resolution contract
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resolve one track. Called under a timeout; must be cancel-safe.
    async fn resolve(&self, track: &Track) -> Result<ResolvedTrack>;
}

/// Resolver over a NetEase-compatible HTTP API
/// (`/song/url/v1`, `/song/detail`, `/lyric/new`)
pub struct NeteaseResolver {
    http_client: reqwest::Client,
    base_url: String,
    cookie: Option<String>,
    level: String,
}

impl NeteaseResolver {
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::Config("resolver.base_url is not set".into()));
        }

        // The retry helper bounds each attempt; this is only a backstop
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.timeout_ms.saturating_mul(2)))
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            cookie: config.cookie.clone().filter(|c| !c.is_empty()),
            level: config.audio_quality.clone(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http_client.get(&url).query(query);
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn audio_url(&self, id: &str) -> Result<String> {
        let body: SongUrlResponse = self
            .get_json("/song/url/v1", &[("id", id), ("level", &self.level)])
            .await?;

        body.data
            .into_iter()
            .next()
            .and_then(|d| d.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::resolution_failed(id, "no playable audio url"))
    }

    async fn detail(&self, id: &str) -> Result<Option<SongDetail>> {
        let body: SongDetailResponse = self.get_json("/song/detail", &[("ids", id)]).await?;
        Ok(body.songs.into_iter().next())
    }

    async fn lyric(&self, id: &str) -> Option<String> {
        match self.get_json::<LyricResponse>("/lyric/new", &[("id", id)]).await {
            Ok(body) => body.lrc.and_then(|l| l.lyric).filter(|l| !l.is_empty()),
            Err(e) => {
                tracing::debug!(id, error = %e, "Lyric lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl TrackResolver for NeteaseResolver {
    async fn resolve(&self, track: &Track) -> Result<ResolvedTrack> {
        let id = track.id.source_id();
        tracing::debug!(track = %track.id, "Resolving via NetEase API");

        let audio_url = self.audio_url(id).await?;

        let mut track = track.clone();
        if let Some(detail) = self.detail(id).await? {
            detail.merge_into(&mut track);
        }

        let mut resolved = ResolvedTrack::new(track, audio_url);
        resolved.lyric = self.lyric(id).await;

        tracing::info!(
            track = %resolved.track.id,
            title = %resolved.track.title,
            duration = %resolved.track.duration_text(),
            "Resolved track"
        );
        Ok(resolved)
    }
}

#[derive(Debug, Deserialize)]
struct SongUrlResponse {
    #[serde(default)]
    data: Vec<SongUrlData>,
}

#[derive(Debug, Deserialize)]
struct SongUrlData {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SongDetailResponse {
    #[serde(default)]
    songs: Vec<SongDetail>,
}

#[derive(Debug, Deserialize)]
struct SongDetail {
    #[serde(default)]
    name: String,
    #[serde(default)]
    ar: Vec<NamedRef>,
    al: Option<AlbumRef>,
    /// Duration in milliseconds
    #[serde(default)]
    dt: u64,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumRef {
    #[serde(default)]
    name: String,
    #[serde(rename = "picUrl")]
    pic_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LyricResponse {
    lrc: Option<LyricBody>,
}

#[derive(Debug, Deserialize)]
struct LyricBody {
    lyric: Option<String>,
}

impl SongDetail {
    /// Fill what the enqueuing surface left blank; the provider's duration wins
    fn merge_into(self, track: &mut Track) {
        if track.title.is_empty() && !self.name.is_empty() {
            track.title = self.name;
        }
        if track.artist.is_empty() {
            let artists: Vec<_> = self
                .ar
                .into_iter()
                .map(|a| a.name)
                .filter(|n| !n.is_empty())
                .collect();
            if !artists.is_empty() {
                track.artist = artists.join(" / ");
            }
        }
        if self.dt > 0 {
            track.duration_ms = self.dt;
        }
        if let Some(album) = self.al {
            if track.album.is_empty() {
                track.album = album.name;
            }
            if track.cover.is_none() {
                track.cover = album.pic_url;
            }
        }
    }
}
