//! Incremental sheet crawling: column mapping, type coercion, and the
//! per-connection sync sequence.

pub mod mapper;
pub mod service;

pub use mapper::ColumnMapper;
pub use service::{CrawlerService, PreviewResponse, SyncOutcome};
