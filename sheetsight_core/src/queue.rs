//! Sync-task queue boundary.
//!
//! The broker is external and durable; the worker treats it as an opaque
//! FIFO with at-least-once delivery: a dequeue hands back a receipt, and
//! only an explicit ack removes the task for good. Tasks that are dequeued
//! but never acked are redelivered by the broker's recovery path.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::models::SyncTask;
use crate::{Error, Result};

/// Opaque redelivery handle returned by `dequeue` and consumed by `ack`.
#[derive(Debug, Clone)]
pub struct QueueReceipt(pub(crate) String);

impl QueueReceipt {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, task: &SyncTask) -> Result<()>;
    /// Blocking dequeue with a timeout; `None` when the window elapses
    /// without a task.
    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<(SyncTask, QueueReceipt)>>;
    async fn ack(&self, queue: &str, receipt: QueueReceipt) -> Result<()>;
    async fn len(&self, queue: &str) -> Result<u64>;
}

#[derive(Default)]
struct MemoryQueues {
    pending: HashMap<String, VecDeque<String>>,
    processing: HashMap<String, Vec<String>>,
}

/// In-memory queue for development and tests. Single-process only.
#[derive(Default)]
pub struct MemoryTaskQueue {
    queues: Mutex<MemoryQueues>,
    wakeup: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unacked in-flight payload count (primarily for tests).
    pub async fn in_flight(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.processing.get(queue).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, queue: &str, task: &SyncTask) -> Result<()> {
        let payload =
            serde_json::to_string(task).map_err(|e| Error::backend("serialize sync task", e))?;
        let mut queues = self.queues.lock().await;
        queues
            .pending
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        drop(queues);
        self.wakeup.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<(SyncTask, QueueReceipt)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut queues = self.queues.lock().await;
                if let Some(payload) = queues
                    .pending
                    .get_mut(queue)
                    .and_then(VecDeque::pop_front)
                {
                    queues
                        .processing
                        .entry(queue.to_string())
                        .or_default()
                        .push(payload.clone());
                    let task: SyncTask = serde_json::from_str(&payload)
                        .map_err(|e| Error::backend("decode sync task", e))?;
                    return Ok(Some((task, QueueReceipt(payload))));
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, self.wakeup.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, receipt: QueueReceipt) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(processing) = queues.processing.get_mut(queue) {
            if let Some(pos) = processing.iter().position(|p| *p == receipt.0) {
                processing.remove(pos);
            }
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        let queues = self.queues.lock().await;
        Ok(queues.pending.get(queue).map(VecDeque::len).unwrap_or(0) as u64)
    }
}
