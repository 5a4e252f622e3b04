//! In-process state store

use super::{revision_of, StateStore, KEY_PLAY_STATE};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{watch, Notify};

pub struct MemoryStateStore {
    values: Mutex<HashMap<String, Value>>,
    commands: Mutex<VecDeque<String>>,
    command_ready: Notify,
    revision: watch::Sender<u64>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            values: Mutex::new(HashMap::new()),
            commands: Mutex::new(VecDeque::new()),
            command_ready: Notify::new(),
            revision,
        }
    }

    /// Commands waiting to be popped
    pub fn pending_commands(&self) -> usize {
        self.commands.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn try_pop(&self) -> Option<String> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.clone());

        if key == KEY_PLAY_STATE {
            if let Some(revision) = revision_of(value) {
                self.revision.send_if_modified(|current| {
                    let changed = *current != revision;
                    *current = revision;
                    changed
                });
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }

    async fn push_command(&self, body: &str) -> Result<()> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(body.to_string());
        self.command_ready.notify_one();
        Ok(())
    }

    async fn pop_command(&self, wait: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking, so a push in between is not lost
            let notified = self.command_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(body) = self.try_pop() {
                return Ok(Some(body));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop());
            }
        }
    }

    async fn wait_revision(&self, after: u64, wait: Duration) -> Result<Option<u64>> {
        let mut rx = self.revision.subscribe();
        let outcome = tokio::time::timeout(wait, rx.wait_for(|revision| *revision > after)).await;
        Ok(match outcome {
            Ok(Ok(revision)) => Some(*revision),
            _ => None,
        })
    }
}
