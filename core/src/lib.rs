//! # notifybus-core
//!
//! In-process publish/subscribe broker on top of PostgreSQL LISTEN/NOTIFY.
//!
//! This crate provides the core functionality for notifybus:
//! - Topic to channel encoding that is safe to splice into SQL
//! - A subscription registry with drop-to-unsubscribe handles
//! - A self-healing background listener loop
//! - Atomic batched publishing
//! - An async reader/writer lock guarding SQLite access
//!
//! ## Features
//! - `sqlite` - Enable SQLite backend for the access layer (default)
//! - `postgres` - Enable PostgreSQL backend with LISTEN/NOTIFY (default)

pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod listener;
pub mod lock;
pub mod notification;
pub mod publisher;
pub mod pubsub;
pub mod registry;

#[cfg(test)]
mod testing;

pub use channel::Channel;
pub use config::Config;
pub use error::{Error, Result};
pub use lock::AsyncRwLock;
pub use notification::Notification;
pub use pubsub::PubSub;
pub use registry::{Callback, ErrorHook, Subscription};
