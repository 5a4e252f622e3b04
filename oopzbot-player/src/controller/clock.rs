//! Playback position of the current track
//!
//! Measured on the tokio clock so that paused-time tests drive it; converted
//! to wall-clock `start_time` only when state is published.

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PlaybackClock {
    /// Elapsed seconds at `anchor`
    offset: f64,
    /// `None` while paused
    anchor: Option<Instant>,
}

impl PlaybackClock {
    /// Running from `offset`
    pub fn started_at(offset: f64) -> Self {
        Self {
            offset,
            anchor: Some(Instant::now()),
        }
    }

    pub fn elapsed(&self) -> f64 {
        match self.anchor {
            Some(anchor) => self.offset + anchor.elapsed().as_secs_f64(),
            None => self.offset,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.anchor.is_none()
    }

    pub fn pause(&mut self) {
        self.offset = self.elapsed();
        self.anchor = None;
    }

    pub fn resume(&mut self) {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }

    /// Jump to `offset`; a paused clock stays paused
    pub fn seek(&mut self, offset: f64) {
        self.offset = offset;
        if self.anchor.is_some() {
            self.anchor = Some(Instant::now());
        }
    }
}
