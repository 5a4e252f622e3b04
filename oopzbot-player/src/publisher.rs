//! State Publisher
//!
//! Sole write path from the controller into the shared state store. The
//! controller hands over each snapshot through a latest-value channel and
//! never waits on the store; a dedicated task writes `queue`, `current` and
//! then `play_state`, so a reader that sees a revision also sees the queue
//! and current track of that revision.
//!
//! A snapshot whose write failed after all retries stays dirty and is
//! written again on the next change or the next reconcile tick.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::queue::CurrentTrack;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{StateStore, KEY_CURRENT, KEY_PLAY_STATE, KEY_QUEUE};
use oopzbot_common::{PlayState, QueueEntry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything published for one revision
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub play_state: PlayState,
    pub current: Option<CurrentTrack>,
    pub queue: Vec<QueueEntry>,
}

impl Snapshot {
    pub fn revision(&self) -> u64 {
        self.play_state.revision
    }
}

/// Controller-side handle
#[derive(Clone)]
pub struct StatePublisher {
    latest: Arc<watch::Sender<Option<Arc<Snapshot>>>>,
    written: watch::Receiver<u64>,
}

impl StatePublisher {
    /// Spawn the writer task against `store`
    pub fn spawn(store: Arc<dyn StateStore>, config: &StoreConfig) -> (Self, JoinHandle<()>) {
        Self::spawn_with(store, config.retry_policy(), config.reconcile_interval())
    }

    pub fn spawn_with(
        store: Arc<dyn StateStore>,
        policy: RetryPolicy,
        reconcile_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (written_tx, written_rx) = watch::channel(0);

        let writer = Writer {
            store,
            policy,
            reconcile_interval,
            written: written_tx,
        };
        let task = tokio::spawn(writer.run(latest_rx));

        (
            Self {
                latest: Arc::new(latest_tx),
                written: written_rx,
            },
            task,
        )
    }

    /// Hand over a snapshot; replaces any snapshot not yet written
    pub fn publish(&self, snapshot: Snapshot) {
        self.latest.send_replace(Some(Arc::new(snapshot)));
    }

    /// Revision of the last snapshot fully written to the store
    pub fn written_revision(&self) -> u64 {
        *self.written.borrow()
    }

    /// Wait until a revision >= `revision` has been written
    pub async fn wait_written(&self, revision: u64, timeout: Duration) -> bool {
        let mut rx = self.written.clone();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|written| *written >= revision))
            .await
            .map(|waited| waited.is_ok());
        outcome.unwrap_or(false)
    }
}

struct Writer {
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
    reconcile_interval: Duration,
    written: watch::Sender<u64>,
}

impl Writer {
    async fn run(self, mut latest: watch::Receiver<Option<Arc<Snapshot>>>) {
        let mut dirty: Option<Arc<Snapshot>> = None;
        let mut reconcile = tokio::time::interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = latest.changed() => {
                    if changed.is_err() {
                        debug!("State publisher handle dropped, writer exiting");
                        break;
                    }
                    let snapshot = latest.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        dirty = self.write_or_keep(snapshot).await;
                    }
                }
                _ = reconcile.tick(), if dirty.is_some() => {
                    if let Some(snapshot) = dirty.take() {
                        debug!(revision = snapshot.revision(), "Reconciling unwritten state");
                        dirty = self.write_or_keep(snapshot).await;
                    }
                }
            }
        }

        // Flush whatever the controller handed over last, if not yet written
        let last = latest.borrow().clone();
        if let Some(snapshot) = last.or(dirty) {
            if snapshot.revision() > *self.written.borrow() {
                let _ = self.write(&snapshot).await;
            }
        }
    }

    /// Write, returning the snapshot back when it stays dirty
    async fn write_or_keep(&self, snapshot: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        match self.write(&snapshot).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    revision = snapshot.revision(),
                    error = %e,
                    "State write failed, local state continues"
                );
                Some(snapshot)
            }
        }
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let queue = serde_json::to_value(&snapshot.queue)?;
        self.put(KEY_QUEUE, queue).await?;

        match &snapshot.current {
            Some(current) => self.put(KEY_CURRENT, serde_json::to_value(current)?).await?,
            None => self.delete(KEY_CURRENT).await?,
        }

        let play_state = serde_json::to_value(&snapshot.play_state)?;
        self.put(KEY_PLAY_STATE, play_state).await?;

        let revision = snapshot.revision();
        self.written.send_if_modified(|written| {
            let advanced = revision > *written;
            if advanced {
                *written = revision;
            }
            advanced
        });
        if snapshot.play_state.is_cleared() {
            info!(revision, "Published cleared play state");
        } else {
            debug!(revision, "Published play state");
        }
        Ok(())
    }

    async fn put(&self, key: &'static str, value: Value) -> Result<()> {
        let store = &self.store;
        let value = &value;
        retry_with_backoff(
            "state_put",
            &self.policy,
            |timeout| Error::StoreWriteFailed(format!("put {} timed out after {:?}", key, timeout)),
            |_| async move { store.put(key, value).await.map_err(|e| store_error(key, e)) },
        )
        .await
    }

    async fn delete(&self, key: &'static str) -> Result<()> {
        let store = &self.store;
        retry_with_backoff(
            "state_delete",
            &self.policy,
            |timeout| {
                Error::StoreWriteFailed(format!("delete {} timed out after {:?}", key, timeout))
            },
            |_| async move { store.delete(key).await.map_err(|e| store_error(key, e)) },
        )
        .await
    }
}

fn store_error(key: &str, e: Error) -> Error {
    match e {
        Error::StoreWriteFailed(_) => e,
        other => Error::StoreWriteFailed(format!("{}: {}", key, other)),
    }
}
