//! Source-sheet client boundary.
//!
//! Every request through this trait costs rate-limiter tokens; callers
//! acquire before calling. The REST backend lives in [`rest`], the
//! scripted test double in [`fake`].

pub mod fake;
pub mod rest;

use async_trait::async_trait;

use crate::Result;

pub use fake::FakeSheets;
pub use rest::RestSheetsClient;

#[derive(Debug, Clone)]
pub struct SheetMetadata {
    pub title: String,
    pub tabs: Vec<String>,
}

#[async_trait]
pub trait SheetsClient: Send + Sync {
    async fn get_metadata(&self, sheet_id: &str) -> Result<SheetMetadata>;
    /// The cells of a single row (used for the header row).
    async fn get_header_row(&self, sheet_id: &str, tab: &str, header_row: u64)
        -> Result<Vec<String>>;
    /// All rows from `start_row` (1-based) to the end of the tab.
    async fn get_values(&self, sheet_id: &str, tab: &str, start_row: u64)
        -> Result<Vec<Vec<String>>>;
    async fn check_access(&self, sheet_id: &str) -> Result<bool>;
}
