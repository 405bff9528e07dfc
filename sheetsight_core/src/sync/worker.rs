//! The sync worker: dequeue, pay rate-limiter tokens, crawl, ack.
//!
//! Delivery is at-least-once, so every handled task ends in an ack — success,
//! requeue-for-retry, and terminal failure alike. A connection-keyed lock
//! serializes attempts per connection even if the scheduler misbehaves and
//! enqueues duplicates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::crawler::CrawlerService;
use crate::events::sheet_sync;
use crate::limiter::SheetsRateLimiter;
use crate::models::SyncTask;
use crate::notify::Notifier;
use crate::queue::TaskQueue;
use crate::store::ConnectionStore;
use crate::Result;

/// Each sync costs two upstream requests: the header fetch and the values
/// fetch.
pub const REQUESTS_PER_SYNC: u32 = 2;
pub const MAX_RETRIES: u32 = 3;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

pub struct SyncWorker {
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    limiter: Arc<SheetsRateLimiter>,
    crawler: Arc<CrawlerService>,
    connections: Arc<dyn ConnectionStore>,
    notifier: Arc<dyn Notifier>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    running: AtomicBool,
}

pub struct SyncWorkerHandle {
    worker: Arc<SyncWorker>,
    task: JoinHandle<()>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        queue_name: impl Into<String>,
        limiter: Arc<SheetsRateLimiter>,
        crawler: Arc<CrawlerService>,
        connections: Arc<dyn ConnectionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            limiter,
            crawler,
            connections,
            notifier,
            locks: DashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the worker loop. The returned handle stops it gracefully.
    pub fn start(worker: Arc<Self>) -> SyncWorkerHandle {
        worker.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        SyncWorkerHandle { worker, task }
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn run(&self) {
        tracing::info!(queue = %self.queue_name, "sync worker started");
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.run_once().await {
                tracing::warn!(error = %err, "worker iteration failed");
                tokio::time::sleep(ERROR_PAUSE).await;
            }
        }
        tracing::info!("sync worker stopped");
    }

    /// One worker iteration. Returns whether a task was handled.
    pub async fn run_once(&self) -> Result<bool> {
        let Some((task, receipt)) = self.queue.dequeue(&self.queue_name, DEQUEUE_TIMEOUT).await?
        else {
            return Ok(false);
        };

        // A deleted or sync-disabled connection is a stale task: drain it
        // without burning rate-limit tokens.
        let connection = self.connections.find_connection(&task.connection_id).await?;
        let active = connection.map(|c| c.sync_enabled).unwrap_or(false);
        if !active {
            tracing::info!(
                connection_id = %task.connection_id,
                "dropping task for missing or disabled connection"
            );
            self.queue.ack(&self.queue_name, receipt).await?;
            return Ok(true);
        }

        self.limiter.acquire(REQUESTS_PER_SYNC).await?;

        let lock = self
            .locks
            .entry(task.connection_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        tracing::info!(
            connection_id = %task.connection_id,
            retry = task.retry_count,
            "processing sync task"
        );
        match self
            .crawler
            .sync(&task.connection_id, Some(&task.user_id))
            .await
        {
            Ok(_) => {}
            Err(err) => self.handle_failure(&task, &err.to_string()).await?,
        }
        self.queue.ack(&self.queue_name, receipt).await?;
        Ok(true)
    }

    async fn handle_failure(&self, task: &SyncTask, error: &str) -> Result<()> {
        if task.retry_count < MAX_RETRIES {
            let retried = task.retried();
            self.queue.enqueue(&self.queue_name, &retried).await?;
            tracing::info!(
                connection_id = %task.connection_id,
                retry = retried.retry_count,
                max = MAX_RETRIES,
                "re-queued failed sync task"
            );
        } else {
            tracing::error!(
                connection_id = %task.connection_id,
                "sync task exhausted retries"
            );
            self.notifier
                .emit_to_user(
                    &task.user_id,
                    sheet_sync::FAILED,
                    json!({
                        "connection_id": task.connection_id,
                        "error": format!("Sync failed after {MAX_RETRIES} retries: {error}"),
                    }),
                )
                .await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl SyncWorkerHandle {
    /// Signal the loop to stop and wait for the in-flight iteration.
    pub async fn shutdown(self) {
        self.worker.stop();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsCache;
    use crate::cache::MemoryCache;
    use crate::models::{ColumnMapping, Connection, DataType};
    use crate::notify::MemoryNotifier;
    use crate::queue::MemoryTaskQueue;
    use crate::sheets::FakeSheets;
    use crate::store::MemoryDocumentStore;
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        sheets: Arc<FakeSheets>,
        queue: Arc<MemoryTaskQueue>,
        notifier: Arc<MemoryNotifier>,
        worker: SyncWorker,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let sheets = Arc::new(FakeSheets::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let limiter = Arc::new(SheetsRateLimiter::new(1.0));
        let now = Utc::now();
        store
            .insert_connection(Connection {
                id: "c1".into(),
                user_id: "u1".into(),
                sheet_id: "s1".into(),
                tab_name: "Orders".into(),
                column_mappings: vec![ColumnMapping {
                    system_field: "order_id".into(),
                    sheet_column: "A".into(),
                    data_type: DataType::String,
                    required: false,
                }],
                header_row: 1,
                data_start_row: 2,
                sync_enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        sheets
            .set_rows(
                "s1",
                "Orders",
                vec![vec!["Order".into()], vec!["O1".into()]],
            )
            .await;
        let crawler = Arc::new(CrawlerService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            sheets.clone(),
            limiter.clone(),
            AnalyticsCache::new(Arc::new(MemoryCache::new())),
            notifier.clone(),
        ));
        let worker = SyncWorker::new(
            queue.clone(),
            "q",
            limiter,
            crawler,
            store.clone(),
            notifier.clone(),
        );
        Fixture {
            store,
            sheets,
            queue,
            notifier,
            worker,
        }
    }

    #[tokio::test]
    async fn successful_task_is_acked() {
        let fx = fixture().await;
        fx.queue.enqueue("q", &SyncTask::new("c1", "u1")).await.unwrap();
        assert!(fx.worker.run_once().await.unwrap());
        assert_eq!(fx.queue.len("q").await.unwrap(), 0);
        assert_eq!(fx.queue.in_flight("q").await, 0);
        assert_eq!(fx.store.rows_for("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn failed_task_is_requeued_with_retry_count() {
        let fx = fixture().await;
        fx.sheets.fail_next("boom").await;
        fx.queue.enqueue("q", &SyncTask::new("c1", "u1")).await.unwrap();
        assert!(fx.worker.run_once().await.unwrap());

        // The original task is acked and a retry sits in the queue.
        assert_eq!(fx.queue.in_flight("q").await, 0);
        let (retried, _) = fx
            .queue
            .dequeue("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.connection_id, "c1");
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_emit_terminal_failure() {
        let fx = fixture().await;
        fx.sheets.fail_next("boom").await;
        let mut task = SyncTask::new("c1", "u1");
        task.retry_count = MAX_RETRIES;
        fx.queue.enqueue("q", &task).await.unwrap();
        assert!(fx.worker.run_once().await.unwrap());

        assert_eq!(fx.queue.len("q").await.unwrap(), 0);
        let events = fx.notifier.events().await;
        let terminal = events
            .iter()
            .filter(|e| e.event == sheet_sync::FAILED)
            .last()
            .unwrap();
        assert!(terminal.payload["error"]
            .as_str()
            .unwrap()
            .contains("after 3 retries"));
    }

    #[tokio::test]
    async fn stale_task_for_missing_connection_is_drained() {
        let fx = fixture().await;
        fx.queue
            .enqueue("q", &SyncTask::new("gone", "u1"))
            .await
            .unwrap();
        assert!(fx.worker.run_once().await.unwrap());
        assert_eq!(fx.queue.len("q").await.unwrap(), 0);
        assert_eq!(fx.queue.in_flight("q").await, 0);
        assert!(fx.notifier.events().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_connection_is_drained() {
        let fx = fixture().await;
        let mut connection = fx.store.find_connection("c1").await.unwrap().unwrap();
        connection.sync_enabled = false;
        fx.store.update_connection(&connection).await.unwrap();

        fx.queue.enqueue("q", &SyncTask::new("c1", "u1")).await.unwrap();
        assert!(fx.worker.run_once().await.unwrap());
        assert!(fx.store.rows_for("c1").await.is_empty());
        assert_eq!(fx.queue.len("q").await.unwrap(), 0);
    }
}
