//! Streaming Actuator Bridge
//!
//! A task that exclusively owns an ordered list of [`ActuatorBackend`]s.
//! Everything else talks to it through a [`BridgeHandle`]; operations are
//! fire-and-forget and applied in order.
//!
//! The bridge keeps its own cursor (stream, offset, paused) and the last
//! room and volume, so that when the active backend dies (failed operation,
//! failed or slow heartbeat) the next backend can be brought up and put back
//! where the old one was. Selection is sticky: a working backend is never
//! replaced. With no working backend left the bridge is degraded: operations
//! only update the cursor, and the next `start` makes one recovery pass.
//!
//! A stream the agent refuses ([`Error::StreamRejected`]) is not an agent
//! failure: the backend stays, the cursor is dropped so no failover replays
//! the dead URL, and the controller gets [`ActuatorEvent::StreamFailed`].

use super::{ActuatorBackend, RoomCredentials};
use crate::config::ActuatorConfig;
use crate::error::{Error, Result};
use crate::relay::CommandRelay;
use oopzbot_common::{Notification, NotificationKind};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Timing knobs of the bridge
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub init_timeout: Duration,
    pub op_timeout: Duration,
}

impl From<&ActuatorConfig> for BridgeSettings {
    fn from(config: &ActuatorConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            init_timeout: config.init_timeout(),
            op_timeout: config.op_timeout(),
        }
    }
}

/// Status changes reported to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorEvent {
    /// A backend came up at startup
    Ready { backend: String },
    /// The active backend died and another one took over
    FailedOver { from: String, to: String },
    /// No backend works; audio is muted
    Degraded,
    /// A backend came up again after a degraded period
    Recovered { backend: String },
    /// The agent is fine but refused the stream; the cursor was dropped
    StreamFailed { stream_ref: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub backend: Option<String>,
    pub degraded: bool,
    pub failovers: u64,
    pub stream_ref: Option<String>,
    /// Elapsed seconds of the current stream as tracked by the bridge
    pub offset: f64,
    pub paused: bool,
    pub volume: u8,
    pub room: Option<String>,
}

enum Op {
    Join(RoomCredentials),
    Leave,
    Start { stream_ref: String, offset: f64 },
    Pause,
    Resume,
    Seek(f64),
    SetVolume(u8),
    Stop,
    Status(oneshot::Sender<BridgeStatus>),
}

/// Handle used by the controller (and anything else) to drive the agent
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<Op>,
}

impl BridgeHandle {
    pub fn join(&self, room: RoomCredentials) {
        self.send(Op::Join(room));
    }

    pub fn leave(&self) {
        self.send(Op::Leave);
    }

    pub fn start(&self, stream_ref: impl Into<String>, offset: f64) {
        self.send(Op::Start {
            stream_ref: stream_ref.into(),
            offset,
        });
    }

    pub fn pause(&self) {
        self.send(Op::Pause);
    }

    pub fn resume(&self) {
        self.send(Op::Resume);
    }

    pub fn seek(&self, offset: f64) {
        self.send(Op::Seek(offset));
    }

    pub fn set_volume(&self, level: u8) {
        self.send(Op::SetVolume(level));
    }

    pub fn stop(&self) {
        self.send(Op::Stop);
    }

    pub async fn status(&self) -> Result<BridgeStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Op::Status(reply))
            .map_err(|_| Error::ActuatorUnavailable("bridge task stopped".into()))?;
        rx.await
            .map_err(|_| Error::ActuatorUnavailable("bridge task stopped".into()))
    }

    fn send(&self, op: Op) {
        if self.tx.send(op).is_err() {
            debug!("Actuator bridge stopped, dropping operation");
        }
    }
}

/// Position of the stream the agent should be playing
struct Cursor {
    stream_ref: String,
    offset: f64,
    anchor: Instant,
    paused: bool,
}

impl Cursor {
    fn new(stream_ref: String, offset: f64) -> Self {
        Self {
            stream_ref,
            offset,
            anchor: Instant::now(),
            paused: false,
        }
    }

    fn elapsed(&self) -> f64 {
        if self.paused {
            self.offset
        } else {
            self.offset + self.anchor.elapsed().as_secs_f64()
        }
    }

    fn pause(&mut self) {
        self.offset = self.elapsed();
        self.anchor = Instant::now();
        self.paused = true;
    }

    fn resume(&mut self) {
        self.anchor = Instant::now();
        self.paused = false;
    }

    fn seek(&mut self, offset: f64) {
        self.offset = offset;
        self.anchor = Instant::now();
    }
}

/// One transport call, owned so it can be retried against another backend
enum Call {
    Join(RoomCredentials),
    Leave,
    Start { stream_ref: String, offset: f64 },
    /// Stop and start again at `offset` (backend cannot seek in place)
    Restart { stream_ref: String, offset: f64, paused: bool },
    Pause,
    Resume,
    Seek(f64),
    Volume(u8),
    Stop,
}

impl Call {
    fn name(&self) -> &'static str {
        match self {
            Call::Join(_) => "join",
            Call::Leave => "leave",
            Call::Start { .. } => "start",
            Call::Restart { .. } => "restart",
            Call::Pause => "pause",
            Call::Resume => "resume",
            Call::Seek(_) => "seek",
            Call::Volume(_) => "set_volume",
            Call::Stop => "stop",
        }
    }
}

async fn invoke(backend: &mut dyn ActuatorBackend, call: &Call) -> Result<()> {
    match call {
        Call::Join(room) => backend.join(room).await,
        Call::Leave => backend.leave().await,
        Call::Start { stream_ref, offset } => backend.start(stream_ref, *offset).await,
        Call::Restart {
            stream_ref,
            offset,
            paused,
        } => {
            backend.stop().await?;
            backend.start(stream_ref, *offset).await?;
            if *paused {
                backend.pause().await?;
            }
            Ok(())
        }
        Call::Pause => backend.pause().await,
        Call::Resume => backend.resume().await,
        Call::Seek(offset) => backend.seek(*offset).await,
        Call::Volume(level) => backend.set_volume(*level).await,
        Call::Stop => backend.stop().await,
    }
}

pub struct Bridge {
    backends: Vec<Box<dyn ActuatorBackend>>,
    active: Option<usize>,
    degraded: bool,
    settings: BridgeSettings,
    room: Option<RoomCredentials>,
    cursor: Option<Cursor>,
    volume: u8,
    failovers: u64,
    events: mpsc::UnboundedSender<ActuatorEvent>,
    relay: Option<CommandRelay>,
}

impl Bridge {
    /// Spawn the bridge task.
    ///
    /// `backends` are tried in order at startup; `relay` receives NOTIFY
    /// commands on degradation and recovery.
    pub fn spawn(
        backends: Vec<Box<dyn ActuatorBackend>>,
        settings: BridgeSettings,
        initial_volume: u8,
        relay: Option<CommandRelay>,
    ) -> (BridgeHandle, mpsc::UnboundedReceiver<ActuatorEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let bridge = Bridge {
            backends,
            active: None,
            degraded: false,
            settings,
            room: None,
            cursor: None,
            volume: initial_volume,
            failovers: 0,
            events,
            relay,
        };
        let task = tokio::spawn(bridge.run(rx));

        (BridgeHandle { tx }, events_rx, task)
    }

    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        self.bring_up().await;

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                op = ops.recv() => match op {
                    Some(op) => self.handle(op).await,
                    None => break,
                },
                _ = heartbeat.tick(), if self.active.is_some() => self.heartbeat().await,
            }
        }

        if let Some(idx) = self.active.take() {
            info!(backend = self.backends[idx].name(), "Shutting down actuator backend");
            let _ = timeout(self.settings.op_timeout, self.backends[idx].shutdown()).await;
        }
    }

    async fn bring_up(&mut self) {
        if self.backends.is_empty() {
            info!("No actuator backends configured, audio output disabled");
            self.degraded = true;
            return;
        }

        let order: Vec<usize> = (0..self.backends.len()).collect();
        match self.activate_first(&order).await {
            Some(idx) => {
                let backend = self.backends[idx].name().to_string();
                info!(backend = %backend, "Actuator backend ready");
                self.emit(ActuatorEvent::Ready { backend });
            }
            None => self.enter_degraded().await,
        }
    }

    async fn handle(&mut self, op: Op) {
        match op {
            Op::Join(room) => {
                self.room = Some(room.clone());
                self.exec(Call::Join(room)).await;
            }
            Op::Leave => {
                self.room = None;
                self.exec(Call::Leave).await;
            }
            Op::Start { stream_ref, offset } => {
                self.cursor = Some(Cursor::new(stream_ref.clone(), offset));
                if self.active.is_none() {
                    self.recover().await;
                } else {
                    self.exec(Call::Start { stream_ref, offset }).await;
                }
            }
            Op::Pause => {
                if let Some(cursor) = &mut self.cursor {
                    cursor.pause();
                }
                self.exec(Call::Pause).await;
            }
            Op::Resume => {
                if let Some(cursor) = &mut self.cursor {
                    cursor.resume();
                }
                self.exec(Call::Resume).await;
            }
            Op::Seek(offset) => {
                let Some(cursor) = &mut self.cursor else {
                    debug!(offset, "Seek without a stream, ignoring");
                    return;
                };
                cursor.seek(offset);
                let call = match self.active {
                    Some(idx) if !self.backends[idx].supports_seek() => Call::Restart {
                        stream_ref: cursor.stream_ref.clone(),
                        offset,
                        paused: cursor.paused,
                    },
                    _ => Call::Seek(offset),
                };
                self.exec(call).await;
            }
            Op::SetVolume(level) => {
                self.volume = level;
                self.exec(Call::Volume(level)).await;
            }
            Op::Stop => {
                self.cursor = None;
                self.exec(Call::Stop).await;
            }
            Op::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Run `call` on the active backend; fail over on error or timeout
    async fn exec(&mut self, call: Call) {
        let Some(idx) = self.active else {
            debug!(op = call.name(), "Actuator degraded, operation is a no-op");
            return;
        };

        let backend = self.backends[idx].as_mut();
        let outcome = timeout(self.settings.op_timeout, invoke(backend, &call)).await;
        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(Error::StreamRejected { stream, reason })) => {
                self.stream_failed(stream, reason);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("{} timed out after {:?}", call.name(), self.settings.op_timeout),
        };

        warn!(
            backend = self.backends[idx].name(),
            op = call.name(),
            reason = %reason,
            "Actuator operation failed"
        );
        self.fail_over(reason).await;
    }

    async fn heartbeat(&mut self) {
        let Some(idx) = self.active else {
            return;
        };

        let outcome = timeout(self.settings.heartbeat_timeout, self.backends[idx].heartbeat()).await;
        match outcome {
            Ok(Ok(state)) => {
                debug!(
                    backend = self.backends[idx].name(),
                    joined = state.joined,
                    playing = state.playing,
                    "Actuator heartbeat"
                );
            }
            Ok(Err(e)) => self.fail_over(format!("heartbeat failed: {}", e)).await,
            Err(_) => {
                self.fail_over(format!(
                    "heartbeat timed out after {:?}",
                    self.settings.heartbeat_timeout
                ))
                .await
            }
        }
    }

    /// Replace the active backend, starting after it and wrapping around
    async fn fail_over(&mut self, reason: String) {
        let Some(failed) = self.active.take() else {
            return;
        };
        let from = self.backends[failed].name().to_string();
        warn!(backend = %from, reason = %reason, "Actuator backend failed, falling back");

        let _ = timeout(self.settings.op_timeout, self.backends[failed].shutdown()).await;

        let n = self.backends.len();
        let order: Vec<usize> = (1..=n).map(|i| (failed + i) % n).collect();
        match self.activate_first(&order).await {
            Some(idx) => {
                self.failovers += 1;
                let to = self.backends[idx].name().to_string();
                info!(from = %from, to = %to, "Actuator failover complete");
                self.emit(ActuatorEvent::FailedOver {
                    from: from.clone(),
                    to: to.clone(),
                });
                self.notify(Notification::new(
                    NotificationKind::FailedOver,
                    format!("Audio agent {} failed, switched to {}", from, to),
                ))
                .await;
            }
            None => self.enter_degraded().await,
        }
    }

    /// One pass over every backend while degraded
    async fn recover(&mut self) {
        if self.backends.is_empty() {
            return;
        }

        info!("Actuator degraded, attempting recovery");
        let order: Vec<usize> = (0..self.backends.len()).collect();
        if let Some(idx) = self.activate_first(&order).await {
            let backend = self.backends[idx].name().to_string();
            info!(backend = %backend, "Actuator recovered");
            self.degraded = false;
            self.emit(ActuatorEvent::Recovered {
                backend: backend.clone(),
            });
            self.notify(Notification::new(
                NotificationKind::Recovered,
                format!("Audio restored via {}", backend),
            ))
            .await;
        } else {
            warn!("Actuator recovery failed, staying degraded");
        }
    }

    async fn activate_first(&mut self, order: &[usize]) -> Option<usize> {
        for &idx in order {
            match self.activate(idx).await {
                Ok(()) => {
                    self.active = Some(idx);
                    self.degraded = false;
                    return Some(idx);
                }
                Err(e) => {
                    warn!(backend = self.backends[idx].name(), error = %e, "Actuator backend unavailable");
                    let _ = timeout(self.settings.op_timeout, self.backends[idx].shutdown()).await;
                }
            }
        }
        None
    }

    /// Init `idx` and restore room, volume and stream position on it
    async fn activate(&mut self, idx: usize) -> Result<()> {
        let settings = self.settings.clone();
        let backend = self.backends[idx].as_mut();
        let name = backend.name().to_string();
        let unavailable = |what: &str| Error::ActuatorUnavailable(format!("{}: {} timed out", name, what));

        timeout(settings.init_timeout, backend.init())
            .await
            .map_err(|_| unavailable("init"))??;

        if let Some(room) = &self.room {
            timeout(settings.op_timeout, backend.join(room))
                .await
                .map_err(|_| unavailable("join"))??;
        }

        timeout(settings.op_timeout, backend.set_volume(self.volume))
            .await
            .map_err(|_| unavailable("set_volume"))??;

        let mut rejected = None;
        if let Some(cursor) = &self.cursor {
            let offset = cursor.elapsed();
            debug!(backend = %name, offset, "Restarting stream on backend");
            match timeout(settings.op_timeout, backend.start(&cursor.stream_ref, offset))
                .await
                .map_err(|_| unavailable("start"))?
            {
                Ok(()) if cursor.paused => {
                    timeout(settings.op_timeout, backend.pause())
                        .await
                        .map_err(|_| unavailable("pause"))??;
                }
                Ok(()) => {}
                Err(Error::StreamRejected { stream, reason }) => rejected = Some((stream, reason)),
                Err(e) => return Err(e),
            }
        }

        if let Some((stream, reason)) = rejected {
            self.stream_failed(stream, reason);
        }
        Ok(())
    }

    fn stream_failed(&mut self, stream_ref: String, reason: String) {
        warn!(stream = %stream_ref, reason = %reason, "Agent refused the stream");
        if self.cursor.as_ref().map(|c| c.stream_ref.as_str()) == Some(stream_ref.as_str()) {
            self.cursor = None;
        }
        self.emit(ActuatorEvent::StreamFailed { stream_ref, reason });
    }

    async fn enter_degraded(&mut self) {
        self.active = None;
        if self.degraded {
            return;
        }
        self.degraded = true;
        error!("All actuator backends failed, continuing without audio output");
        self.emit(ActuatorEvent::Degraded);
        self.notify(Notification::new(
            NotificationKind::Degraded,
            "Audio output unavailable, playback continues muted",
        ))
        .await;
    }

    fn status(&self) -> BridgeStatus {
        BridgeStatus {
            backend: self.active.map(|idx| self.backends[idx].name().to_string()),
            degraded: self.degraded,
            failovers: self.failovers,
            stream_ref: self.cursor.as_ref().map(|c| c.stream_ref.clone()),
            offset: self.cursor.as_ref().map(Cursor::elapsed).unwrap_or(0.0),
            paused: self.cursor.as_ref().map(|c| c.paused).unwrap_or(false),
            volume: self.volume,
            room: self.room.as_ref().map(|r| r.channel.clone()),
        }
    }

    fn emit(&self, event: ActuatorEvent) {
        let _ = self.events.send(event);
    }

    async fn notify(&self, notification: Notification) {
        let Some(relay) = &self.relay else {
            return;
        };
        if let Err(e) = relay.notify(&notification).await {
            warn!(error = %e, "Failed to push actuator notification");
        }
    }
}
