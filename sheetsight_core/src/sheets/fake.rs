//! Scripted sheet source for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SheetMetadata, SheetsClient};
use crate::{Error, Result};

#[derive(Default)]
struct FakeState {
    // sheet_id -> tab -> rows (index 0 is sheet row 1)
    sheets: HashMap<String, HashMap<String, Vec<Vec<String>>>>,
    fail_next: Option<String>,
    request_count: u64,
}

#[derive(Default)]
pub struct FakeSheets {
    state: Mutex<FakeState>,
}

impl FakeSheets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a tab's full contents. Rows are positioned from sheet row 1.
    pub async fn set_rows(&self, sheet_id: &str, tab: &str, rows: Vec<Vec<String>>) {
        let mut state = self.state.lock().await;
        state
            .sheets
            .entry(sheet_id.to_string())
            .or_default()
            .insert(tab.to_string(), rows);
    }

    /// Append one row at the bottom of a tab.
    pub async fn push_row(&self, sheet_id: &str, tab: &str, row: Vec<String>) {
        let mut state = self.state.lock().await;
        state
            .sheets
            .entry(sheet_id.to_string())
            .or_default()
            .entry(tab.to_string())
            .or_default()
            .push(row);
    }

    /// Make the next request fail with the given message.
    pub async fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().await.fail_next = Some(message.into());
    }

    pub async fn request_count(&self) -> u64 {
        self.state.lock().await.request_count
    }

    async fn tab_rows(&self, sheet_id: &str, tab: &str) -> Result<Vec<Vec<String>>> {
        let mut state = self.state.lock().await;
        state.request_count += 1;
        if let Some(message) = state.fail_next.take() {
            return Err(Error::message(message));
        }
        state
            .sheets
            .get(sheet_id)
            .ok_or_else(|| Error::NotFound(format!("sheet {sheet_id}")))?
            .get(tab)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tab {tab}")))
    }
}

#[async_trait]
impl SheetsClient for FakeSheets {
    async fn get_metadata(&self, sheet_id: &str) -> Result<SheetMetadata> {
        let mut state = self.state.lock().await;
        state.request_count += 1;
        if let Some(message) = state.fail_next.take() {
            return Err(Error::message(message));
        }
        let tabs = state
            .sheets
            .get(sheet_id)
            .ok_or_else(|| Error::NotFound(format!("sheet {sheet_id}")))?
            .keys()
            .cloned()
            .collect();
        Ok(SheetMetadata {
            title: format!("Sheet {sheet_id}"),
            tabs,
        })
    }

    async fn get_header_row(
        &self,
        sheet_id: &str,
        tab: &str,
        header_row: u64,
    ) -> Result<Vec<String>> {
        let rows = self.tab_rows(sheet_id, tab).await?;
        Ok(rows
            .get((header_row.max(1) - 1) as usize)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_values(
        &self,
        sheet_id: &str,
        tab: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>> {
        let rows = self.tab_rows(sheet_id, tab).await?;
        let skip = (start_row.max(1) - 1) as usize;
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn check_access(&self, sheet_id: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.sheets.contains_key(sheet_id))
    }
}
