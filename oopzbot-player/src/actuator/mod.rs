//! Streaming actuator
//!
//! The audio-rendering agent (a browser page running an RTC client) behind a
//! small transport capability set. [`bridge`] owns every backend and handles
//! fallback; [`webdriver`] is the concrete browser backend.

pub mod bridge;
pub mod webdriver;

pub use bridge::{ActuatorEvent, Bridge, BridgeHandle, BridgeSettings, BridgeStatus};
pub use webdriver::WebDriverBackend;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Voice room the agent publishes audio into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCredentials {
    pub app_id: String,
    pub channel: String,
    pub uid: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// What the agent reports on a heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub joined: bool,
    #[serde(default)]
    pub playing: bool,
    /// Position reported by the agent, seconds
    #[serde(default)]
    pub position: Option<f64>,
}

/// One way of driving an audio-rendering agent.
///
/// Each call is bounded by the bridge's operation timeout; any error makes
/// the bridge fail over to the next backend.
#[async_trait]
pub trait ActuatorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the agent up (launch, load the player page, wait until ready)
    async fn init(&mut self) -> Result<()>;

    async fn join(&mut self, room: &RoomCredentials) -> Result<()>;

    async fn leave(&mut self) -> Result<()>;

    /// Start streaming `stream_ref` from `offset` seconds
    async fn start(&mut self, stream_ref: &str, offset: f64) -> Result<()>;

    async fn pause(&mut self) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    async fn seek(&mut self, offset: f64) -> Result<()>;

    /// 0-100
    async fn set_volume(&mut self, level: u8) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    async fn heartbeat(&mut self) -> Result<AgentState>;

    /// Tear the agent down; best effort
    async fn shutdown(&mut self);

    /// Whether `seek` works in place; when false the bridge restarts the
    /// stream at the new offset instead
    fn supports_seek(&self) -> bool {
        true
    }
}
