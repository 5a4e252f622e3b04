//! Serialized entry point of the playback controller

use super::ControllerSnapshot;
use crate::error::{Error, Result};
use oopzbot_common::{Command, QueueEntry, ResolvedTrack, Track, TrackId};
use tokio::sync::{mpsc, oneshot};

/// Everything the controller task reacts to, in arrival order
pub(crate) enum Message {
    Command(Command),
    Enqueue {
        track: Track,
        requester: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    Remove {
        index: usize,
        reply: oneshot::Sender<Result<QueueEntry>>,
    },
    Promote {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearQueue {
        reply: oneshot::Sender<Result<usize>>,
    },
    /// Background resolution of the entry about to play finished
    Resolved {
        generation: u64,
        entry: QueueEntry,
        result: Result<ResolvedTrack>,
    },
    /// Background prefetch of the queue head finished
    Prefetched {
        generation: u64,
        track_id: TrackId,
        result: Result<ResolvedTrack>,
    },
    /// Fresh resolution of the playing track after the agent refused its stream
    Refreshed {
        generation: u64,
        result: Result<ResolvedTrack>,
    },
    Snapshot {
        reply: oneshot::Sender<ControllerSnapshot>,
    },
}

/// Cloneable handle; every call is queued behind earlier ones
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Message>,
}

impl ControllerHandle {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Queue a command; returns once the controller has accepted it
    pub async fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(Message::Command(command))
            .await
            .map_err(|_| Error::ControllerGone)
    }

    /// Append a track; returns its 1-based queue position
    pub async fn enqueue(&self, track: Track, requester: impl Into<String>) -> Result<usize> {
        let requester = requester.into();
        self.request(|reply| Message::Enqueue {
            track,
            requester,
            reply,
        })
        .await?
    }

    pub async fn remove(&self, index: usize) -> Result<QueueEntry> {
        self.request(|reply| Message::Remove { index, reply }).await?
    }

    /// Move the entry at `index` to the head of the queue
    pub async fn promote(&self, index: usize) -> Result<()> {
        self.request(|reply| Message::Promote { index, reply }).await?
    }

    pub async fn clear_queue(&self) -> Result<usize> {
        self.request(|reply| Message::ClearQueue { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot> {
        self.request(|reply| Message::Snapshot { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ControllerGone)?;
        rx.await.map_err(|_| Error::ControllerGone)
    }
}
