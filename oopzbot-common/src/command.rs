//! Playback commands and their wire encodings
//!
//! Two encodings are accepted on the relay:
//! - the compact string form used by the web control surface
//!   (`next`, `stop`, `pause`, `resume`, `seek:<seconds>`, `volume:<0-100>`,
//!   `notify:<json>`)
//! - a JSON document `{"kind": "...", ..., "issued_at": "..."}`, which is what
//!   in-process producers push because it keeps `issued_at`

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a command asks the controller to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    Next,
    Stop,
    Pause,
    Resume,
    /// Jump to an absolute position, in seconds
    Seek { offset: f64 },
    /// Set output volume, 0-100
    Volume { level: u8 },
    /// Forward a payload to the chat transport
    Notify { payload: serde_json::Value },
}

/// A user or control-surface intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub kind: CommandKind,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            issued_at: Utc::now(),
        }
    }

    pub fn next() -> Self {
        Self::new(CommandKind::Next)
    }

    pub fn stop() -> Self {
        Self::new(CommandKind::Stop)
    }

    pub fn pause() -> Self {
        Self::new(CommandKind::Pause)
    }

    pub fn resume() -> Self {
        Self::new(CommandKind::Resume)
    }

    pub fn seek(offset: f64) -> Self {
        Self::new(CommandKind::Seek { offset })
    }

    pub fn volume(level: u8) -> Self {
        Self::new(CommandKind::Volume { level })
    }

    pub fn notify(payload: serde_json::Value) -> Self {
        Self::new(CommandKind::Notify { payload })
    }

    /// Decode either wire encoding.
    ///
    /// Anything that does not decode to a valid command is
    /// [`Error::MalformedCommand`].
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(malformed(raw, "empty command"));
        }

        if raw.starts_with('{') {
            let command: Command = serde_json::from_str(raw)
                .map_err(|e| malformed(raw, &e.to_string()))?;
            command.validate().map_err(|reason| malformed(raw, &reason))?;
            return Ok(command);
        }

        let (verb, arg) = match raw.split_once(':') {
            Some((verb, arg)) => (verb.trim().to_ascii_lowercase(), Some(arg)),
            None => (raw.to_ascii_lowercase(), None),
        };

        let kind = match (verb.as_str(), arg) {
            ("next", None) => CommandKind::Next,
            ("stop", None) => CommandKind::Stop,
            ("pause", None) => CommandKind::Pause,
            ("resume", None) => CommandKind::Resume,
            ("seek", Some(arg)) => {
                let offset = arg
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| malformed(raw, &e.to_string()))?;
                CommandKind::Seek { offset }
            }
            ("volume", Some(arg)) => {
                let level = arg
                    .trim()
                    .parse::<u8>()
                    .map_err(|e| malformed(raw, &e.to_string()))?;
                CommandKind::Volume { level }
            }
            ("notify", Some(arg)) => {
                let payload = serde_json::from_str(arg)
                    .map_err(|e| malformed(raw, &e.to_string()))?;
                CommandKind::Notify { payload }
            }
            _ => return Err(malformed(raw, "unknown command")),
        };

        let command = Self::new(kind);
        command.validate().map_err(|reason| malformed(raw, &reason))?;
        Ok(command)
    }

    /// JSON encoding (keeps `issued_at`)
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match &self.kind {
            CommandKind::Seek { offset } if !offset.is_finite() || *offset < 0.0 => {
                Err(format!("seek offset out of range: {}", offset))
            }
            CommandKind::Volume { level } if *level > 100 => {
                Err(format!("volume out of range: {}", level))
            }
            _ => Ok(()),
        }
    }
}

/// Compact string encoding
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::Next => write!(f, "next"),
            CommandKind::Stop => write!(f, "stop"),
            CommandKind::Pause => write!(f, "pause"),
            CommandKind::Resume => write!(f, "resume"),
            CommandKind::Seek { offset } => write!(f, "seek:{}", offset),
            CommandKind::Volume { level } => write!(f, "volume:{}", level),
            CommandKind::Notify { payload } => write!(f, "notify:{}", payload),
        }
    }
}

fn malformed(raw: &str, reason: &str) -> Error {
    Error::MalformedCommand(format!("{:?}: {}", raw, reason))
}
