//! # oopzbot Common Library
//!
//! Shared code for the oopzbot playback core and its control surfaces:
//! - Data model (tracks, queue entries, play state, cache entries)
//! - Command type and its wire codec
//! - Bootstrap configuration file lookup
//! - Database initialization and schema
//! - Time helpers

pub mod command;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod model;
pub mod time;

pub use command::{Command, CommandKind};
pub use error::{Error, Result};
pub use model::{
    CacheEntry, Notification, NotificationKind, PlayState, QueueEntry, ResolvedTrack, Track,
    TrackId,
};
