use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::models::SyncTask;
use crate::queue::{QueueReceipt, TaskQueue};
use crate::{Error, Result};

/// Redis list queue with at-least-once delivery.
///
/// `RPUSH` enqueues; `BLMOVE` atomically moves the head into a per-queue
/// processing list (the receipt is the raw payload); `LREM` on ack removes
/// it for good. Payloads stranded in the processing list by a crashed
/// worker are visible for operational requeue.
#[derive(Clone)]
pub struct RedisTaskQueue {
    manager: ConnectionManager,
}

impl RedisTaskQueue {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn processing_list(queue: &str) -> String {
        format!("{queue}:processing")
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    #[tracing::instrument(level = "debug", skip(self, task), fields(connection_id = %task.connection_id))]
    async fn enqueue(&self, queue: &str, task: &SyncTask) -> Result<()> {
        let payload =
            serde_json::to_string(task).map_err(|e| Error::backend("serialize sync task", e))?;
        let mut conn = self.manager.clone();
        redis::cmd("RPUSH")
            .arg(queue)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::backend("redis rpush", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<(SyncTask, QueueReceipt)>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(Self::processing_list(queue))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis blmove", e))?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let task: SyncTask =
            serde_json::from_str(&payload).map_err(|e| Error::backend("decode sync task", e))?;
        Ok(Some((task, QueueReceipt(payload))))
    }

    #[tracing::instrument(level = "debug", skip(self, receipt))]
    async fn ack(&self, queue: &str, receipt: QueueReceipt) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("LREM")
            .arg(Self::processing_list(queue))
            .arg(1)
            .arg(receipt.0)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::backend("redis lrem", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn len(&self, queue: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let n: i64 = redis::cmd("LLEN")
            .arg(queue)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis llen", e))?;
        Ok(n.max(0) as u64)
    }
}
