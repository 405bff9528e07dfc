//! The per-connection sync sequence.
//!
//! One attempt: load state, announce start, fetch headers + values, map and
//! upsert each row, advance the cursor, invalidate the analytics cache, and
//! announce the terminal outcome. Exactly one `sheet:sync:started` and
//! exactly one of `sheet:sync:completed` / `sheet:sync:failed` per attempt.
//! Failures after the state flips to `syncing` mark the state failed and
//! propagate so the worker can retry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use super::mapper::ColumnMapper;
use crate::analytics::AnalyticsCache;
use crate::events::sheet_sync;
use crate::limiter::SheetsRateLimiter;
use crate::models::{Connection, SheetRow, SyncState, SyncStatus};
use crate::notify::Notifier;
use crate::sheets::SheetsClient;
use crate::store::{ConnectionStore, SheetRowStore, SyncStateStore};
use crate::{Error, Result};

/// Rate-limiter cost of one preview: header fetch + values fetch.
const REQUESTS_PER_PREVIEW: u32 = 2;
const PREVIEW_MAX_ROWS: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub rows_synced: u64,
    pub total_rows: u64,
}

#[derive(Debug, Clone)]
pub struct PreviewResponse {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub total_rows: u64,
}

pub struct CrawlerService {
    connections: Arc<dyn ConnectionStore>,
    sync_states: Arc<dyn SyncStateStore>,
    rows: Arc<dyn SheetRowStore>,
    sheets: Arc<dyn SheetsClient>,
    limiter: Arc<SheetsRateLimiter>,
    cache: AnalyticsCache,
    notifier: Arc<dyn Notifier>,
    mapper: ColumnMapper,
}

impl CrawlerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        sync_states: Arc<dyn SyncStateStore>,
        rows: Arc<dyn SheetRowStore>,
        sheets: Arc<dyn SheetsClient>,
        limiter: Arc<SheetsRateLimiter>,
        cache: AnalyticsCache,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            connections,
            sync_states,
            rows,
            sheets,
            limiter,
            cache,
            notifier,
            mapper: ColumnMapper::new(),
        }
    }

    /// Run one sync attempt for a connection.
    ///
    /// The caller (the worker) has already paid the rate-limiter tokens for
    /// this attempt's requests.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn sync(&self, connection_id: &str, user_id: Option<&str>) -> Result<SyncOutcome> {
        let connection = self
            .connections
            .find_connection(connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;
        let owner = user_id.unwrap_or(&connection.user_id).to_string();

        let state = self
            .sync_states
            .find_sync_state(connection_id)
            .await?
            .unwrap_or_else(|| SyncState::initial(connection_id));

        self.notifier
            .emit_to_user(
                &owner,
                sheet_sync::STARTED,
                json!({ "connection_id": connection_id }),
            )
            .await;

        self.sync_states
            .upsert_sync_state(SyncState {
                status: SyncStatus::Syncing,
                ..state.clone()
            })
            .await?;

        match self.run_sync(&connection, &state).await {
            Ok(outcome) => {
                self.cache.invalidate(connection_id).await;
                self.notifier
                    .emit_to_user(
                        &owner,
                        sheet_sync::COMPLETED,
                        json!({
                            "connection_id": connection_id,
                            "rows_synced": outcome.rows_synced,
                            "total_rows": outcome.total_rows,
                        }),
                    )
                    .await;
                tracing::info!(
                    connection_id,
                    rows_synced = outcome.rows_synced,
                    total_rows = outcome.total_rows,
                    "sync completed"
                );
                Ok(outcome)
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(connection_id, error = %message, "sync failed");
                self.sync_states
                    .upsert_sync_state(SyncState {
                        status: SyncStatus::Failed,
                        last_error: Some(message.clone()),
                        ..state
                    })
                    .await?;
                self.notifier
                    .emit_to_user(
                        &owner,
                        sheet_sync::FAILED,
                        json!({
                            "connection_id": connection_id,
                            "error": message,
                        }),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn run_sync(&self, connection: &Connection, state: &SyncState) -> Result<SyncOutcome> {
        let start_row = connection.data_start_row.max(state.last_synced_row + 1);

        let headers = self
            .sheets
            .get_header_row(&connection.sheet_id, &connection.tab_name, connection.header_row)
            .await?;
        self.mapper
            .validate_required_columns(&headers, &connection.column_mappings)?;

        let fetched = self
            .sheets
            .get_values(&connection.sheet_id, &connection.tab_name, start_row)
            .await?;
        let fetched_count = fetched.len() as u64;

        let mut rows_synced = 0u64;
        for (offset, row) in fetched.iter().enumerate() {
            let row_number = start_row + offset as u64;
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            let data = self
                .mapper
                .map_row(row, &headers, &connection.column_mappings)?;
            let raw = self.mapper.raw_row(row, &headers);
            self.rows
                .upsert_row(SheetRow {
                    connection_id: connection.id.clone(),
                    row_number,
                    data,
                    raw,
                    synced_at: Utc::now(),
                })
                .await?;
            rows_synced += 1;
        }

        let last_synced_row = if rows_synced > 0 {
            start_row + fetched_count - 1
        } else {
            state.last_synced_row
        };
        let total_rows = state.total_rows_synced + rows_synced;

        self.sync_states
            .upsert_sync_state(SyncState {
                connection_id: connection.id.clone(),
                last_synced_row,
                last_sync_time: Some(Utc::now()),
                status: SyncStatus::Success,
                last_error: None,
                total_rows_synced: total_rows,
            })
            .await?;

        Ok(SyncOutcome {
            rows_synced,
            total_rows,
        })
    }

    /// Fetch a preview of the tab: header row plus up to `rows` data rows.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn preview(&self, connection_id: &str, rows: usize) -> Result<PreviewResponse> {
        let connection = self
            .connections
            .find_connection(connection_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;

        self.limiter.acquire(REQUESTS_PER_PREVIEW).await?;

        let headers = self
            .sheets
            .get_header_row(&connection.sheet_id, &connection.tab_name, connection.header_row)
            .await?;
        let all = self
            .sheets
            .get_values(&connection.sheet_id, &connection.tab_name, connection.data_start_row)
            .await?;
        let total_rows = all.len() as u64;
        let rows = all
            .into_iter()
            .take(rows.min(PREVIEW_MAX_ROWS))
            .collect();

        Ok(PreviewResponse {
            headers,
            rows,
            total_rows,
        })
    }

    pub async fn sync_state(&self, connection_id: &str) -> Result<Option<SyncState>> {
        self.sync_states.find_sync_state(connection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsCache;
    use crate::cache::{Cache, MemoryCache};
    use crate::models::{ColumnMapping, DataType};
    use crate::notify::MemoryNotifier;
    use crate::sheets::FakeSheets;
    use crate::store::MemoryDocumentStore;

    fn s1_mappings() -> Vec<ColumnMapping> {
        vec![
            ColumnMapping {
                system_field: "order_id".into(),
                sheet_column: "A".into(),
                data_type: DataType::String,
                required: false,
            },
            ColumnMapping {
                system_field: "platform".into(),
                sheet_column: "C".into(),
                data_type: DataType::String,
                required: false,
            },
            ColumnMapping {
                system_field: "total_amount".into(),
                sheet_column: "P".into(),
                data_type: DataType::Number,
                required: true,
            },
        ]
    }

    fn sheet_row(order_id: &str, platform: &str, amount: &str) -> Vec<String> {
        let mut row = vec![order_id.to_string(), String::new(), platform.to_string()];
        row.resize(15, String::new());
        row.push(amount.to_string());
        row
    }

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        sheets: Arc<FakeSheets>,
        notifier: Arc<MemoryNotifier>,
        cache_backend: Arc<MemoryCache>,
        crawler: CrawlerService,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let sheets = Arc::new(FakeSheets::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let cache_backend = Arc::new(MemoryCache::new());
        let now = Utc::now();
        store
            .insert_connection(Connection {
                id: "c1".into(),
                user_id: "u1".into(),
                sheet_id: "s1".into(),
                tab_name: "Orders".into(),
                column_mappings: s1_mappings(),
                header_row: 1,
                data_start_row: 2,
                sync_enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let crawler = CrawlerService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            sheets.clone(),
            Arc::new(SheetsRateLimiter::new(1.0)),
            AnalyticsCache::new(cache_backend.clone()),
            notifier.clone(),
        );
        Fixture {
            store,
            sheets,
            notifier,
            cache_backend,
            crawler,
        }
    }

    #[tokio::test]
    async fn incremental_sync_is_idempotent() {
        let fx = fixture().await;
        fx.sheets
            .set_rows(
                "s1",
                "Orders",
                vec![
                    vec!["Order".into(), "".into(), "Platform".into()],
                    sheet_row("O1", "Shopee", "100"),
                    sheet_row("O2", "Lazada", "200"),
                ],
            )
            .await;

        // First sync: cursor 0 -> 3, two rows written.
        let outcome = fx.crawler.sync("c1", None).await.unwrap();
        assert_eq!(outcome.rows_synced, 2);
        let state = fx.store.find_sync_state("c1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_row, 3);
        assert_eq!(state.status, SyncStatus::Success);
        let rows = fx.store.rows_for("c1").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].data["total_amount"], json!(100.0));
        assert_eq!(rows[1].data["total_amount"], json!(200.0));

        // Second sync with no source changes: zero writes, cursor unchanged.
        let outcome = fx.crawler.sync("c1", None).await.unwrap();
        assert_eq!(outcome.rows_synced, 0);
        let state = fx.store.find_sync_state("c1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_row, 3);
        assert_eq!(fx.store.rows_for("c1").await.len(), 2);

        // Row 4 appears; its amount fails coercion and is kept verbatim.
        fx.sheets
            .push_row("s1", "Orders", sheet_row("O3", "Tiki", "abc"))
            .await;
        let outcome = fx.crawler.sync("c1", None).await.unwrap();
        assert_eq!(outcome.rows_synced, 1);
        let state = fx.store.find_sync_state("c1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_row, 4);
        assert_eq!(state.total_rows_synced, 3);
        let rows = fx.store.rows_for("c1").await;
        assert_eq!(rows[2].data["total_amount"], json!("abc"));
    }

    #[tokio::test]
    async fn event_protocol_per_attempt() {
        let fx = fixture().await;
        fx.sheets
            .set_rows(
                "s1",
                "Orders",
                vec![
                    vec!["Order".into()],
                    sheet_row("O1", "Shopee", "100"),
                ],
            )
            .await;
        fx.crawler.sync("c1", None).await.unwrap();

        fx.sheets.fail_next("quota exceeded").await;
        fx.crawler.sync("c1", None).await.unwrap_err();

        let events = fx.notifier.event_names("user:u1").await;
        assert_eq!(
            events,
            vec![
                sheet_sync::STARTED.to_string(),
                sheet_sync::COMPLETED.to_string(),
                sheet_sync::STARTED.to_string(),
                sheet_sync::FAILED.to_string(),
            ]
        );

        let state = fx.store.find_sync_state("c1").await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert!(state.last_error.as_deref().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn missing_required_column_fails_the_sync() {
        let fx = fixture().await;
        let mut connection = fx.store.find_connection("c1").await.unwrap().unwrap();
        connection.column_mappings = vec![ColumnMapping {
            system_field: "total_amount".into(),
            sheet_column: "Revenue".into(),
            data_type: DataType::Number,
            required: true,
        }];
        fx.store.update_connection(&connection).await.unwrap();
        fx.sheets
            .set_rows(
                "s1",
                "Orders",
                vec![vec!["Order".into()], sheet_row("O1", "Shopee", "100")],
            )
            .await;

        let err = fx.crawler.sync("c1", None).await.unwrap_err();
        assert_eq!(
            err.code(),
            Some(crate::error::codes::MISSING_REQUIRED_COLUMN)
        );
        assert!(fx.store.rows_for("c1").await.is_empty());
    }

    #[tokio::test]
    async fn successful_sync_invalidates_connection_cache() {
        let fx = fixture().await;
        fx.cache_backend
            .set_ex("analytics:c1:summary:deadbeef00000000", 300, "{}")
            .await
            .unwrap();
        fx.cache_backend
            .set_ex("analytics:c2:summary:deadbeef00000000", 300, "{}")
            .await
            .unwrap();
        fx.sheets
            .set_rows(
                "s1",
                "Orders",
                vec![vec!["Order".into()], sheet_row("O1", "Shopee", "100")],
            )
            .await;

        fx.crawler.sync("c1", None).await.unwrap();
        assert!(fx
            .cache_backend
            .get("analytics:c1:summary:deadbeef00000000")
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .cache_backend
            .get("analytics:c2:summary:deadbeef00000000")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn empty_rows_are_skipped_but_advance_the_cursor() {
        let fx = fixture().await;
        fx.sheets
            .set_rows(
                "s1",
                "Orders",
                vec![
                    vec!["Order".into()],
                    sheet_row("O1", "Shopee", "100"),
                    vec!["".into(), "".into()],
                    sheet_row("O3", "Tiki", "300"),
                ],
            )
            .await;
        let outcome = fx.crawler.sync("c1", None).await.unwrap();
        assert_eq!(outcome.rows_synced, 2);
        let state = fx.store.find_sync_state("c1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_row, 4);
        let rows = fx.store.rows_for("c1").await;
        assert_eq!(rows.iter().map(|r| r.row_number).collect::<Vec<_>>(), vec![2, 4]);
    }
}
