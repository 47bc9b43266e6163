//! Session manager: the single concurrency boundary of the engine.
//!
//! All mutating traffic flows through [`SessionManager`], which serializes
//! work per session, keeps the in-memory cache consistent with the durable
//! store, and fans state changes out to live subscribers.

pub mod config;
mod manager;

pub use manager::{state_dir, ManagerOptions, NewSession, SessionManager};
