//! # oopzbot Playback Core (oopzbot-player)
//!
//! Playback orchestration for the chat bot: a FIFO request queue, a playback
//! controller state machine that owns all play state, a cache in front of
//! track resolution, a command relay from presentation surfaces, a
//! streaming actuator bridge with ordered backend fallback, and a state
//! publisher writing the versioned state documents.
//!
//! **Architecture:** one controller task serializes every mutation; every
//! other component talks to it through [`controller::ControllerHandle`].

pub mod actuator;
pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod notify;
pub mod publisher;
pub mod queue;
pub mod relay;
pub mod retry;
pub mod store;

pub use config::Config;
pub use controller::{Controller, ControllerDeps, ControllerHandle, ControllerSettings, Phase};
pub use error::{Error, Result};
