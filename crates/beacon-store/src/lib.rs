//! # beacon-store
//!
//! Bounded on-disk persistence for the gateway: the outbound queue and the
//! channel registry survive restarts so queued messages can be replayed.
//! Rendered message history is never stored here.
//!
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection` with typed helpers for both tables.

pub mod channels;
pub mod database;
pub mod migrations;
pub mod queue;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
