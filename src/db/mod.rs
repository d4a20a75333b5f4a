//! Database module for dbsync.
//!
//! Provides SQLite storage for target definitions and the event log.

mod models;
mod secret;
mod store;

pub use models::*;
pub use secret::*;
pub use store::*;
