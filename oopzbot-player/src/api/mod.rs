//! HTTP state/command API
//!
//! Thin surface for presentation layers: read the published state documents,
//! push commands onto the relay, manage the queue, read play statistics.

pub mod handlers;
pub mod server;

pub use server::{build_router, run, AppContext};
