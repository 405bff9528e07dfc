//! HTTP surface and process wiring for sheetsight.
//!
//! The request-facing process serves `/healthz` and the internal
//! `/trigger-sync` endpoint; worker processes run the sync loop. Both are
//! started from the same binary via subcommands.

pub mod cli;
pub mod error;
pub mod routes;
pub mod state;
