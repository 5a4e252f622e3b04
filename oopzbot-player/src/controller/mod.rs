//! Playback Controller
//!
//! Single owner of every playback decision. One task consumes a message
//! channel fed by the command relay, the HTTP surface, background
//! resolution/prefetch tasks, a periodic tick and actuator status events;
//! queue and play state are only mutated from inside that loop.
//!
//! ```text
//! IDLE ──enqueue/next──▶ RESOLVING ──ok──▶ PLAYING ⇄ PAUSED
//!   ▲                        │ fail (skip)     │ tick: elapsed >= duration
//!   └──── queue empty ◀──────┴─────────────────┘ (advance)
//! ```
//!
//! Resolution never runs inside the loop. Results come back tagged with the
//! generation they were started under; NEXT, STOP and every advance bump the
//! generation, so late results are dropped.
//!
//! When the agent refuses the playing stream (typically an expired URL) the
//! track is re-resolved once and restarted at its current offset. A second
//! refusal skips it. A queue head that cannot be taken because the store
//! write failed is retried on the next tick.

pub mod clock;
mod handle;

pub use clock::PlaybackClock;
pub use handle::ControllerHandle;

use crate::actuator::{ActuatorEvent, BridgeHandle};
use crate::cache::TrackCache;
use crate::config::PlaybackConfig;
use crate::error::Result;
use crate::notify::Notifier;
use crate::publisher::{Snapshot, StatePublisher};
use crate::queue::{CurrentTrack, QueueStore};
use crate::relay::CommandRelay;
use handle::Message;
use oopzbot_common::{
    Command, CommandKind, Notification, NotificationKind, PlayState, QueueEntry, ResolvedTrack,
    Track, TrackId,
};
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Resolving,
    Playing,
    Paused,
}

/// Point-in-time view of the controller, for the HTTP surface and tests
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub phase: Phase,
    pub play_state: PlayState,
    pub current: Option<CurrentTrack>,
    pub queue: Vec<QueueEntry>,
    /// Elapsed seconds of the current track
    pub elapsed: f64,
    pub generation: u64,
    pub actuator_degraded: bool,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Seconds assumed for tracks without a known duration
    pub default_duration: f64,
    pub tick_interval: Duration,
    pub prefetch: bool,
    pub default_volume: u8,
}

impl From<&PlaybackConfig> for ControllerSettings {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            default_duration: config.default_duration_secs as f64,
            tick_interval: config.tick_interval(),
            prefetch: config.prefetch,
            default_volume: config.default_volume,
        }
    }
}

/// Components the controller drives
pub struct ControllerDeps {
    pub queue: Arc<QueueStore>,
    pub cache: Arc<TrackCache>,
    pub bridge: BridgeHandle,
    pub publisher: StatePublisher,
    pub relay: CommandRelay,
    pub notifier: Arc<dyn Notifier>,
}

struct NowPlaying {
    current: CurrentTrack,
    duration: f64,
    clock: PlaybackClock,
    /// A refresh was already spent on this track
    refreshed: bool,
}

struct Prefetched {
    generation: u64,
    resolved: ResolvedTrack,
}

pub struct Controller {
    deps: ControllerDeps,
    settings: ControllerSettings,
    phase: Phase,
    now_playing: Option<NowPlaying>,
    generation: u64,
    revision: u64,
    volume: u8,
    prefetched: Option<Prefetched>,
    prefetch_target: Option<TrackId>,
    actuator_degraded: bool,
    /// The last advance could not take the queue head
    pending_advance: bool,
    self_tx: mpsc::WeakSender<Message>,
}

impl Controller {
    /// Spawn the controller task.
    ///
    /// `initial` is the last persisted play state: its revision and volume
    /// carry over, everything else starts from IDLE. A non-empty queue
    /// starts playing right away.
    pub fn spawn(
        deps: ControllerDeps,
        settings: ControllerSettings,
        initial: Option<PlayState>,
        actuator_events: Option<mpsc::UnboundedReceiver<ActuatorEvent>>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let controller = Controller {
            revision: initial.as_ref().map(|s| s.revision).unwrap_or(0),
            volume: initial
                .as_ref()
                .map(|s| s.volume.min(100))
                .unwrap_or(settings.default_volume),
            deps,
            settings,
            phase: Phase::Idle,
            now_playing: None,
            generation: 0,
            prefetched: None,
            prefetch_target: None,
            actuator_degraded: false,
            pending_advance: false,
            self_tx: tx.downgrade(),
        };
        let task = tokio::spawn(controller.run(rx, actuator_events));

        (ControllerHandle::new(tx), task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Message>,
        mut actuator_events: Option<mpsc::UnboundedReceiver<ActuatorEvent>>,
    ) {
        info!(
            revision = self.revision,
            volume = self.volume,
            "Playback controller started"
        );
        self.deps.bridge.set_volume(self.volume);
        self.publish().await;

        if !self.deps.queue.is_empty().await {
            info!("Resuming playback of persisted queue");
            self.advance().await;
        }

        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
                event = next_event(&mut actuator_events) => match event {
                    Some(event) => self.on_actuator_event(event).await,
                    None => actuator_events = None,
                },
            }
        }

        info!("Playback controller stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Command(command) => self.apply(command).await,
            Message::Enqueue {
                track,
                requester,
                reply,
            } => {
                let result = self.deps.queue.enqueue(track, &requester).await;
                let enqueued = result.is_ok();
                let _ = reply.send(result);
                if enqueued {
                    if self.phase == Phase::Idle {
                        self.advance().await;
                    } else {
                        self.queue_changed().await;
                    }
                }
            }
            Message::Remove { index, reply } => {
                let result = self.deps.queue.remove(index).await;
                let removed = result.is_ok();
                let _ = reply.send(result);
                if removed {
                    self.queue_changed().await;
                }
            }
            Message::Promote { index, reply } => {
                let result = self.deps.queue.promote(index).await;
                let promoted = result.is_ok();
                let _ = reply.send(result);
                if promoted {
                    self.queue_changed().await;
                }
            }
            Message::ClearQueue { reply } => {
                let result = self.deps.queue.clear().await;
                let cleared = result.is_ok();
                let _ = reply.send(result);
                if cleared {
                    self.queue_changed().await;
                }
            }
            Message::Resolved {
                generation,
                entry,
                result,
            } => self.on_resolved(generation, entry, result).await,
            Message::Prefetched {
                generation,
                track_id,
                result,
            } => self.on_prefetched(generation, track_id, result),
            Message::Refreshed { generation, result } => {
                self.on_refreshed(generation, result).await
            }
            Message::Snapshot { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
        }
    }

    async fn apply(&mut self, command: Command) {
        debug!(command = %command, phase = ?self.phase, "Applying command");
        match command.kind {
            CommandKind::Next => {
                if self.phase == Phase::Idle && self.deps.queue.is_empty().await {
                    debug!("NEXT with nothing queued, ignoring");
                    return;
                }
                info!("Skipping to next track");
                self.advance().await;
            }
            CommandKind::Stop => self.stop().await,
            CommandKind::Pause => {
                let Some(now_playing) = self.now_playing.as_mut() else {
                    return;
                };
                if self.phase != Phase::Playing {
                    return;
                }
                now_playing.clock.pause();
                self.phase = Phase::Paused;
                self.deps.bridge.pause();
                self.publish().await;
            }
            CommandKind::Resume => {
                let Some(now_playing) = self.now_playing.as_mut() else {
                    return;
                };
                if self.phase != Phase::Paused {
                    return;
                }
                now_playing.clock.resume();
                self.phase = Phase::Playing;
                self.deps.bridge.resume();
                self.publish().await;
            }
            CommandKind::Seek { offset } => {
                let Some(now_playing) = self.now_playing.as_mut() else {
                    debug!(offset, "SEEK with nothing playing, ignoring");
                    return;
                };
                let target = offset.clamp(0.0, now_playing.duration);
                now_playing.clock.seek(target);
                self.deps.bridge.seek(target);
                self.publish().await;
            }
            CommandKind::Volume { level } => {
                self.volume = level.min(100);
                self.deps.bridge.set_volume(self.volume);
                self.publish().await;
            }
            CommandKind::Notify { payload } => {
                self.deliver(Notification::from_payload(payload));
            }
        }
    }

    /// Leave the current track and move to the queue head (or IDLE)
    async fn advance(&mut self) {
        let previous = self.generation;
        self.generation += 1;
        self.prefetch_target = None;

        if self.now_playing.take().is_some() {
            self.deps.bridge.stop();
        }

        let next = match self.deps.queue.dequeue_next().await {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "Failed to take the queue head, retrying on next tick");
                self.pending_advance = true;
                self.phase = Phase::Resolving;
                self.deps.queue.clear_current().await;
                self.publish().await;
                return;
            }
        };
        self.pending_advance = false;
        let Some(entry) = next else {
            self.go_idle().await;
            return;
        };

        match self.prefetched.take() {
            Some(prefetched)
                if prefetched.generation == previous
                    && prefetched.resolved.track.id == entry.track.id =>
            {
                debug!(track = %entry.track.id, "Using prefetched resolution");
                let cache = Arc::clone(&self.deps.cache);
                let key = entry.track.id.clone();
                tokio::spawn(async move { cache.mark_played(&key).await });
                self.start_playback(entry, prefetched.resolved).await;
            }
            _ => self.begin_resolving(entry).await,
        }
    }

    async fn begin_resolving(&mut self, entry: QueueEntry) {
        info!(
            track = %entry.track.id,
            title = %entry.track.title,
            requester = %entry.requester,
            "Resolving next track"
        );
        self.phase = Phase::Resolving;
        self.deps.queue.clear_current().await;
        self.publish().await;

        let generation = self.generation;
        let cache = Arc::clone(&self.deps.cache);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = cache.get_or_resolve(&entry.track).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Message::Resolved {
                        generation,
                        entry,
                        result,
                    })
                    .await;
            }
        });
    }

    async fn on_resolved(&mut self, generation: u64, entry: QueueEntry, result: Result<ResolvedTrack>) {
        if generation != self.generation || self.phase != Phase::Resolving {
            debug!(track = %entry.track.id, generation, "Discarding stale resolution");
            return;
        }

        match result {
            Ok(resolved) => self.start_playback(entry, resolved).await,
            Err(e) => {
                warn!(track = %entry.track.id, error = %e, "Skipping unresolvable track");
                self.skip(&entry.track, &entry.requester, e).await;
            }
        }
    }

    /// Announce that `track` is skipped and move on
    async fn skip(&mut self, track: &Track, requester: &str, reason: impl Display) {
        let message = format!("Skipped {} - {}: {}", track.title, track.artist, reason);
        let notification = Notification::new(NotificationKind::Skipped, message).with_payload(
            serde_json::json!({
                "track_id": track.id,
                "requester": requester,
            }),
        );
        self.emit(notification).await;
        self.advance().await;
    }

    async fn start_playback(&mut self, entry: QueueEntry, resolved: ResolvedTrack) {
        let duration = self.duration_of(&resolved.track, &entry.track);
        let requester = entry.requester.clone();
        let mut current = CurrentTrack::new(entry, resolved.clone());
        current.track = resolved.track.clone();

        info!(
            track = %current.track.id,
            title = %current.track.title,
            artist = %current.track.artist,
            duration,
            "Now playing"
        );

        self.deps.queue.set_current(current.clone()).await;
        self.deps.bridge.start(resolved.audio_url.clone(), 0.0);
        self.now_playing = Some(NowPlaying {
            current,
            duration,
            clock: PlaybackClock::started_at(0.0),
            refreshed: false,
        });
        self.phase = Phase::Playing;

        let metadata = Arc::clone(self.deps.cache.metadata());
        let track_id = resolved.track.id.clone();
        tokio::spawn(async move {
            if let Err(e) = metadata.record_play(&track_id, Some(&requester)).await {
                warn!(track = %track_id, error = %e, "Failed to record play history");
            }
        });

        self.publish().await;
        self.maybe_prefetch().await;
    }

    async fn stop(&mut self) {
        self.generation += 1;
        if let Err(e) = self.deps.queue.clear().await {
            warn!(error = %e, "Failed to clear queue on STOP");
        }
        info!("Playback stopped, queue cleared");
        self.go_idle().await;
    }

    async fn go_idle(&mut self) {
        if self.now_playing.take().is_some() || self.phase != Phase::Idle {
            self.deps.bridge.stop();
        }
        self.phase = Phase::Idle;
        self.pending_advance = false;
        self.prefetched = None;
        self.prefetch_target = None;
        self.deps.queue.clear_current().await;
        self.publish().await;
    }

    async fn on_tick(&mut self) {
        if self.pending_advance {
            debug!("Retrying queue advance");
            self.advance().await;
            return;
        }
        let finished = match (&self.now_playing, self.phase) {
            (Some(now_playing), Phase::Playing) => {
                now_playing.clock.elapsed() >= now_playing.duration
            }
            _ => false,
        };
        if finished {
            debug!("Track finished");
            self.advance().await;
        }
    }

    async fn queue_changed(&mut self) {
        self.maybe_prefetch().await;
        self.publish().await;
    }

    /// Pre-resolve the queue head while something plays
    async fn maybe_prefetch(&mut self) {
        if !self.settings.prefetch || !matches!(self.phase, Phase::Playing | Phase::Paused) {
            return;
        }
        let Some(head) = self.deps.queue.peek_next().await else {
            return;
        };
        if self.prefetch_target.as_ref() == Some(&head.track.id) {
            return;
        }

        debug!(track = %head.track.id, "Prefetching queue head");
        self.prefetch_target = Some(head.track.id.clone());

        let generation = self.generation;
        let cache = Arc::clone(&self.deps.cache);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = cache.prefetch(&head.track).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Message::Prefetched {
                        generation,
                        track_id: head.track.id,
                        result,
                    })
                    .await;
            }
        });
    }

    fn on_prefetched(&mut self, generation: u64, track_id: TrackId, result: Result<ResolvedTrack>) {
        if generation != self.generation || self.prefetch_target.as_ref() != Some(&track_id) {
            debug!(track = %track_id, "Discarding stale prefetch");
            return;
        }
        match result {
            Ok(resolved) => {
                self.prefetched = Some(Prefetched {
                    generation,
                    resolved,
                })
            }
            Err(e) => debug!(track = %track_id, error = %e, "Prefetch failed"),
        }
    }

    async fn on_actuator_event(&mut self, event: ActuatorEvent) {
        match event {
            ActuatorEvent::Degraded => {
                warn!("Actuator degraded, playback state continues without audio");
                self.actuator_degraded = true;
            }
            ActuatorEvent::StreamFailed { stream_ref, reason } => {
                self.on_stream_failed(stream_ref, reason).await
            }
            event => {
                info!(event = ?event, "Actuator available");
                self.actuator_degraded = false;
            }
        }
    }

    async fn on_stream_failed(&mut self, stream_ref: String, reason: String) {
        let Some(now_playing) = self.now_playing.as_mut() else {
            return;
        };
        if now_playing.current.resolved.audio_url != stream_ref {
            debug!(stream = %stream_ref, "Stream failure for a track no longer playing");
            return;
        }
        let track = now_playing.current.track.clone();

        if now_playing.refreshed {
            let requester = now_playing.current.requester.clone();
            warn!(track = %track.id, reason = %reason, "Refreshed stream refused too, skipping");
            self.skip(&track, &requester, reason).await;
            return;
        }
        now_playing.refreshed = true;
        info!(track = %track.id, reason = %reason, "Stream refused, refreshing resolution");

        let generation = self.generation;
        let cache = Arc::clone(&self.deps.cache);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = cache.refresh(&track).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::Refreshed { generation, result }).await;
            }
        });
    }

    async fn on_refreshed(&mut self, generation: u64, result: Result<ResolvedTrack>) {
        if generation != self.generation {
            debug!(generation, "Discarding stale refresh");
            return;
        }
        let Some(now_playing) = self.now_playing.as_mut() else {
            return;
        };

        let resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                let track = now_playing.current.track.clone();
                let requester = now_playing.current.requester.clone();
                warn!(track = %track.id, error = %e, "Refresh failed, skipping");
                self.skip(&track, &requester, e).await;
                return;
            }
        };

        now_playing.current.resolved = resolved;
        let current = now_playing.current.clone();
        let offset = now_playing.clock.elapsed();
        let paused = now_playing.clock.is_paused();
        info!(track = %current.track.id, offset, "Restarting with refreshed stream");

        self.deps.queue.set_current(current.clone()).await;
        self.deps.bridge.start(current.resolved.audio_url, offset);
        if paused {
            self.deps.bridge.pause();
        }
        self.publish().await;
    }

    /// Push a NOTIFY through the relay; deliver directly if that fails
    async fn emit(&self, notification: Notification) {
        if let Err(e) = self.deps.relay.notify(&notification).await {
            warn!(error = %e, "Relay unavailable, delivering notification directly");
            self.deliver(notification);
        }
    }

    fn deliver(&self, notification: Notification) {
        let notifier = Arc::clone(&self.deps.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!(error = %e, "Notification delivery failed");
            }
        });
    }

    fn duration_of(&self, resolved: &Track, queued: &Track) -> f64 {
        [resolved, queued]
            .into_iter()
            .map(Track::duration_secs)
            .find(|secs| *secs > 0.0)
            .unwrap_or(self.settings.default_duration)
    }

    fn play_state(&self) -> PlayState {
        let Some(now_playing) = &self.now_playing else {
            return PlayState::cleared(self.volume, self.revision);
        };

        let elapsed = now_playing.clock.elapsed().min(now_playing.duration);
        let paused = now_playing.clock.is_paused();
        PlayState {
            track_id: Some(now_playing.current.track.id.clone()),
            start_time: oopzbot_common::time::epoch_secs() - elapsed,
            duration: now_playing.duration,
            paused,
            pause_elapsed: paused.then_some(elapsed),
            volume: self.volume,
            revision: self.revision,
        }
    }

    /// Stamp the next revision and hand the state to the publisher
    async fn publish(&mut self) {
        self.revision += 1;
        let snapshot = Snapshot {
            play_state: self.play_state(),
            current: self.deps.queue.current().await,
            queue: self.deps.queue.peek().await,
        };
        self.deps.publisher.publish(snapshot);
    }

    async fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            phase: self.phase,
            play_state: self.play_state(),
            current: self.deps.queue.current().await,
            queue: self.deps.queue.peek().await,
            elapsed: self
                .now_playing
                .as_ref()
                .map(|n| n.clock.elapsed().min(n.duration))
                .unwrap_or(0.0),
            generation: self.generation,
            actuator_degraded: self.actuator_degraded,
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ActuatorEvent>>,
) -> Option<ActuatorEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
