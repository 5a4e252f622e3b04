//! Command Relay
//!
//! Ordered, at-most-once channel from control surfaces into the controller,
//! backed by the shared store's command list. Any number of producers push;
//! exactly one consumer loop pops with a bounded wait and forwards each
//! decoded command to the controller's serialized entry point.

use crate::controller::ControllerHandle;
use crate::error::{Error, Result};
use crate::store::StateStore;
use oopzbot_common::{Command, Notification};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a store error before popping again
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct CommandRelay {
    store: Arc<dyn StateStore>,
    wait: Duration,
}

impl CommandRelay {
    pub fn new(store: Arc<dyn StateStore>, wait: Duration) -> Self {
        Self { store, wait }
    }

    /// Append a command (JSON encoding, keeps `issued_at`)
    pub async fn push(&self, command: &Command) -> Result<()> {
        self.store.push_command(&command.to_json()?).await
    }

    /// Validate a raw surface command, then append it
    pub async fn push_raw(&self, raw: &str) -> Result<Command> {
        let command = Command::parse(raw)?;
        self.push(&command).await?;
        Ok(command)
    }

    /// Push a NOTIFY carrying `notification`
    pub async fn notify(&self, notification: &Notification) -> Result<()> {
        self.push(&Command::notify(serde_json::to_value(notification)?))
            .await
    }

    /// Pop the next command, waiting at most the configured bound.
    ///
    /// Malformed entries are consumed and reported as
    /// [`Error::MalformedCommand`]; they are never redelivered.
    pub async fn next(&self) -> Result<Option<Command>> {
        match self.store.pop_command(self.wait).await? {
            Some(raw) => Command::parse(&raw).map(Some).map_err(Error::from),
            None => Ok(None),
        }
    }

    /// Start the single consumer loop feeding `controller`.
    ///
    /// Exits once the controller is gone.
    pub fn spawn_consumer(self, controller: ControllerHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(wait_ms = self.wait.as_millis() as u64, "Command relay consumer started");
            loop {
                match self.next().await {
                    Ok(Some(command)) => {
                        debug!(command = %command, "Relaying command");
                        if controller.command(command).await.is_err() {
                            info!("Controller stopped, command relay exiting");
                            break;
                        }
                    }
                    Ok(None) => {
                        if controller.is_closed() {
                            break;
                        }
                    }
                    Err(Error::MalformedCommand(reason)) => {
                        warn!(reason = %reason, "Dropping malformed command");
                    }
                    Err(e) => {
                        warn!(error = %e, "Command store unavailable, backing off");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
        })
    }
}
