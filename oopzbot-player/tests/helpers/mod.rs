//! Test helpers for oopzbot-player integration tests
//!
//! Provides reusable test infrastructure components:
//! - ScriptedResolver: track resolution with per-track failures and delays
//! - ScriptedBackend + Remote: actuator backend that can be killed mid-test
//!   or made to refuse particular streams
//! - RecordingNotifier: collects NOTIFY deliveries
//! - RecordingStore: in-memory state store that logs every play_state write
//! - Harness: the full core (controller, relay, bridge, publisher) on
//!   in-memory stores

#![allow(dead_code)]

use async_trait::async_trait;
use oopzbot_common::{Notification, NotificationKind, PlayState, ResolvedTrack, Track, TrackId};
use oopzbot_player::actuator::{
    ActuatorBackend, AgentState, Bridge, BridgeHandle, BridgeSettings, RoomCredentials,
};
use oopzbot_player::api::AppContext;
use oopzbot_player::cache::metadata::{MemoryMetadataStore, MetadataStore};
use oopzbot_player::cache::resolver::TrackResolver;
use oopzbot_player::cache::TrackCache;
use oopzbot_player::controller::ControllerSnapshot;
use oopzbot_player::notify::Notifier;
use oopzbot_player::publisher::StatePublisher;
use oopzbot_player::queue::QueueStore;
use oopzbot_player::relay::CommandRelay;
use oopzbot_player::retry::RetryPolicy;
use oopzbot_player::store::{MemoryStateStore, StateStore, KEY_PLAY_STATE};
use oopzbot_player::{Controller, ControllerDeps, ControllerHandle, ControllerSettings, Error, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn track(id: u32, secs: u64) -> Track {
    Track::new(
        TrackId::new("netease", id),
        format!("Song {}", id),
        format!("Artist {}", id),
        secs * 1000,
    )
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Default)]
struct ResolverScript {
    always_fail: HashSet<TrackId>,
    fail_times: HashMap<TrackId, u32>,
    delays: HashMap<TrackId, Duration>,
    calls: HashMap<TrackId, u32>,
}

#[derive(Default)]
pub struct ScriptedResolver {
    script: Mutex<ResolverScript>,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_always(&self, id: &TrackId) {
        self.script.lock().unwrap().always_fail.insert(id.clone());
    }

    pub fn fail_times(&self, id: &TrackId, times: u32) {
        self.script.lock().unwrap().fail_times.insert(id.clone(), times);
    }

    pub fn delay(&self, id: &TrackId, delay: Duration) {
        self.script.lock().unwrap().delays.insert(id.clone(), delay);
    }

    pub fn calls(&self, id: &TrackId) -> u32 {
        self.script.lock().unwrap().calls.get(id).copied().unwrap_or(0)
    }

    pub fn stream_url(id: &TrackId) -> String {
        format!("http://cdn.test/{}.mp3", id.source_id())
    }
}

#[async_trait]
impl TrackResolver for ScriptedResolver {
    async fn resolve(&self, track: &Track) -> Result<ResolvedTrack> {
        let (delay, fail) = {
            let mut script = self.script.lock().unwrap();
            *script.calls.entry(track.id.clone()).or_insert(0) += 1;
            let delay = script.delays.get(&track.id).copied().unwrap_or_default();
            let mut fail = script.always_fail.contains(&track.id);
            if let Some(remaining) = script.fail_times.get_mut(&track.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    fail = true;
                }
            }
            (delay, fail)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::resolution_failed(&track.id, "no playable url"));
        }
        Ok(ResolvedTrack::new(track.clone(), Self::stream_url(&track.id)))
    }
}

// ============================================================================
// Actuator backend
// ============================================================================

#[derive(Default)]
struct RemoteState {
    calls: Vec<String>,
    starts: Vec<(String, f64)>,
    killed: bool,
    /// Killed heartbeats never answer instead of failing fast
    hang_when_killed: bool,
    fail_init: bool,
    /// Stream url -> refusals left (`u32::MAX` refuses forever)
    refused: HashMap<String, u32>,
}

/// Shared view into a [`ScriptedBackend`] owned by the bridge
#[derive(Clone, Default)]
pub struct Remote(Arc<Mutex<RemoteState>>);

impl Remote {
    pub fn kill(&self) {
        self.0.lock().unwrap().killed = true;
    }

    /// Kill so that heartbeats hang until the bridge times them out
    pub fn freeze(&self) {
        let mut state = self.0.lock().unwrap();
        state.killed = true;
        state.hang_when_killed = true;
    }

    pub fn revive(&self) {
        let mut state = self.0.lock().unwrap();
        state.killed = false;
        state.hang_when_killed = false;
        state.fail_init = false;
    }

    pub fn fail_init(&self) {
        self.0.lock().unwrap().fail_init = true;
    }

    /// Make the agent reject `url` on its next `times` starts
    pub fn refuse_stream(&self, url: &str, times: u32) {
        self.0.lock().unwrap().refused.insert(url.to_string(), times);
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    pub fn starts(&self) -> Vec<(String, f64)> {
        self.0.lock().unwrap().starts.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().calls.iter().filter(|c| c.as_str() == call).count()
    }
}

pub struct ScriptedBackend {
    name: String,
    remote: Remote,
    seek: bool,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> (Self, Remote) {
        let remote = Remote::default();
        (
            Self {
                name: name.to_string(),
                remote: remote.clone(),
                seek: true,
            },
            remote,
        )
    }

    pub fn without_seek(mut self) -> Self {
        self.seek = false;
        self
    }

    fn record(&self, call: String) -> Result<()> {
        let mut state = self.remote.0.lock().unwrap();
        if state.killed {
            return Err(Error::ActuatorUnavailable(format!("{}: agent is gone", self.name)));
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl ActuatorBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<()> {
        if self.remote.0.lock().unwrap().fail_init {
            return Err(Error::ActuatorUnavailable(format!("{}: cannot launch", self.name)));
        }
        self.record("init".into())
    }

    async fn join(&mut self, room: &RoomCredentials) -> Result<()> {
        self.record(format!("join:{}", room.channel))
    }

    async fn leave(&mut self) -> Result<()> {
        self.record("leave".into())
    }

    async fn start(&mut self, stream_ref: &str, offset: f64) -> Result<()> {
        self.record("start".into())?;
        let mut state = self.remote.0.lock().unwrap();
        if let Some(left) = state.refused.get_mut(stream_ref).filter(|left| **left > 0) {
            if *left != u32::MAX {
                *left -= 1;
            }
            return Err(Error::StreamRejected {
                stream: stream_ref.to_string(),
                reason: "403 Forbidden".into(),
            });
        }
        state.starts.push((stream_ref.to_string(), offset));
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        self.record("pause".into())
    }

    async fn resume(&mut self) -> Result<()> {
        self.record("resume".into())
    }

    async fn seek(&mut self, offset: f64) -> Result<()> {
        self.record(format!("seek:{}", offset))
    }

    async fn set_volume(&mut self, level: u8) -> Result<()> {
        self.record(format!("volume:{}", level))
    }

    async fn stop(&mut self) -> Result<()> {
        self.record("stop".into())
    }

    async fn heartbeat(&mut self) -> Result<AgentState> {
        let hang = {
            let state = self.remote.0.lock().unwrap();
            state.killed && state.hang_when_killed
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.record("heartbeat".into())?;
        Ok(AgentState {
            joined: true,
            playing: true,
            position: None,
        })
    }

    async fn shutdown(&mut self) {
        let _ = self.record("shutdown".into());
    }

    fn supports_seek(&self) -> bool {
        self.seek
    }
}

// ============================================================================
// Notifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.delivered()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }

    /// Poll until a notification of `kind` arrives
    pub async fn wait_for(&self, kind: NotificationKind, timeout: Duration) -> Notification {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.of_kind(kind).into_iter().next() {
                return found;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no {:?} notification within {:?}",
                kind,
                timeout
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ============================================================================
// State store
// ============================================================================

/// [`MemoryStateStore`] that keeps every play_state revision written
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStateStore,
    revisions: Mutex<Vec<u64>>,
}

impl RecordingStore {
    pub fn revisions(&self) -> Vec<u64> {
        self.revisions.lock().unwrap().clone()
    }

    pub async fn play_state(&self) -> Option<PlayState> {
        self.inner
            .get(KEY_PLAY_STATE)
            .await
            .unwrap()
            .map(|v| serde_json::from_value(v).unwrap())
    }

    pub fn pending_commands(&self) -> usize {
        self.inner.pending_commands()
    }
}

#[async_trait]
impl StateStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        if key == KEY_PLAY_STATE {
            if let Some(revision) = value.get("revision").and_then(Value::as_u64) {
                self.revisions.lock().unwrap().push(revision);
            }
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn push_command(&self, body: &str) -> Result<()> {
        self.inner.push_command(body).await
    }

    async fn pop_command(&self, wait: Duration) -> Result<Option<String>> {
        self.inner.pop_command(wait).await
    }

    async fn wait_revision(&self, after: u64, wait: Duration) -> Result<Option<u64>> {
        self.inner.wait_revision(after, wait).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn bridge_settings() -> BridgeSettings {
    BridgeSettings {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(2),
        init_timeout: Duration::from_secs(5),
        op_timeout: Duration::from_secs(2),
    }
}

pub struct HarnessBuilder {
    resolver: Arc<ScriptedResolver>,
    backends: Vec<Box<dyn ActuatorBackend>>,
    queue: Option<QueueStore>,
    initial: Option<PlayState>,
    prefetch: bool,
}

impl HarnessBuilder {
    pub fn resolver(mut self, resolver: Arc<ScriptedResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn backend(mut self, backend: ScriptedBackend) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    pub fn queue(mut self, queue: QueueStore) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn initial(mut self, state: PlayState) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn start(self) -> Harness {
        let store = Arc::new(RecordingStore::default());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let cache = Arc::new(TrackCache::new(
            self.resolver.clone(),
            metadata.clone(),
            RetryPolicy {
                attempts: 2,
                timeout: Duration::from_secs(1),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
            0,
        ));

        let (publisher, _) = StatePublisher::spawn_with(
            store.clone(),
            RetryPolicy {
                attempts: 2,
                timeout: Duration::from_millis(200),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
            Duration::from_millis(200),
        );
        let relay = CommandRelay::new(store.clone(), Duration::from_millis(50));
        let (bridge, events, _) = Bridge::spawn(self.backends, bridge_settings(), 80, Some(relay.clone()));

        let notifier = RecordingNotifier::new();
        let (controller, _) = Controller::spawn(
            ControllerDeps {
                queue: Arc::new(self.queue.unwrap_or_default()),
                cache: cache.clone(),
                bridge: bridge.clone(),
                publisher: publisher.clone(),
                relay: relay.clone(),
                notifier: notifier.clone(),
            },
            ControllerSettings {
                default_duration: 300.0,
                tick_interval: Duration::from_millis(100),
                prefetch: self.prefetch,
                default_volume: 80,
            },
            self.initial,
            Some(events),
        );
        relay.clone().spawn_consumer(controller.clone());

        Harness {
            controller,
            relay,
            store,
            metadata,
            cache,
            resolver: self.resolver,
            notifier,
            bridge,
            publisher,
        }
    }
}

pub struct Harness {
    pub controller: ControllerHandle,
    pub relay: CommandRelay,
    pub store: Arc<RecordingStore>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub cache: Arc<TrackCache>,
    pub resolver: Arc<ScriptedResolver>,
    pub notifier: Arc<RecordingNotifier>,
    pub bridge: BridgeHandle,
    pub publisher: StatePublisher,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            resolver: ScriptedResolver::new(),
            backends: Vec::new(),
            queue: None,
            initial: None,
            prefetch: true,
        }
    }

    pub fn app_context(&self) -> AppContext {
        let metadata: Arc<dyn MetadataStore> = self.metadata.clone();
        AppContext {
            controller: self.controller.clone(),
            relay: self.relay.clone(),
            store: self.store.clone(),
            metadata,
            bridge: self.bridge.clone(),
        }
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        self.controller.snapshot().await.unwrap()
    }

    /// Poll the controller until `pred` holds
    pub async fn wait_until(
        &self,
        what: &str,
        timeout: Duration,
        pred: impl Fn(&ControllerSnapshot) -> bool,
    ) -> ControllerSnapshot {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot().await;
            if pred(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}: phase {:?}, current {:?}",
                what,
                snapshot.phase,
                snapshot.current.as_ref().map(|c| c.track.id.clone())
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `id` is the current track and playing
    pub async fn wait_playing(&self, id: &TrackId) -> ControllerSnapshot {
        let id = id.clone();
        self.wait_until("track to play", Duration::from_secs(10), move |s| {
            s.current.as_ref().map(|c| &c.track.id) == Some(&id)
                && s.phase == oopzbot_player::Phase::Playing
        })
        .await
    }

    /// Wait until the publisher has written the controller's latest state
    pub async fn flushed(&self) -> PlayState {
        let revision = self.snapshot().await.play_state.revision;
        assert!(
            self.publisher
                .wait_written(revision, Duration::from_secs(5))
                .await,
            "revision {} never written",
            revision
        );
        self.store.play_state().await.unwrap()
    }
}
