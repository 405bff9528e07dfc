//! Core services for the sheetsight analytics backend.
//!
//! This crate carries the three load-bearing subsystems: the rate-limited
//! sync engine (queue, worker, crawler), the per-sheet-type analytics engine
//! with its cache layer, and the cross-process notification plumbing shared
//! by both. Request-facing HTTP surfaces and the conversational agent live in
//! sibling crates and consume this one through the traits in [`store`],
//! [`notify`], and [`sheets`].

pub mod analytics;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod crawler;
pub mod error;
pub mod events;
pub mod limiter;
pub mod models;
pub mod notify;
pub mod o11y;
pub mod queue;
pub mod redis_backend;
pub mod sheets;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
