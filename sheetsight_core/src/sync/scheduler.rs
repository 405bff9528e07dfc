use std::sync::Arc;

use crate::models::SyncTask;
use crate::queue::TaskQueue;
use crate::store::ConnectionStore;
use crate::Result;

/// Enqueue one sync task per sync-enabled connection, across all users.
/// Returns `(enqueued, total_enabled)`.
#[tracing::instrument(level = "info", skip_all)]
pub async fn enqueue_all_enabled(
    connections: &Arc<dyn ConnectionStore>,
    queue: &Arc<dyn TaskQueue>,
    queue_name: &str,
) -> Result<(usize, usize)> {
    let enabled = connections.find_enabled_connections().await?;
    let total = enabled.len();
    let mut enqueued = 0;
    for connection in enabled {
        let task = SyncTask::new(&connection.id, &connection.user_id);
        match queue.enqueue(queue_name, &task).await {
            Ok(()) => enqueued += 1,
            Err(err) => {
                tracing::warn!(
                    connection_id = %connection.id,
                    error = %err,
                    "failed to enqueue sync task"
                );
            }
        }
    }
    tracing::info!(enqueued, total, "enqueued sync tasks");
    Ok((enqueued, total))
}
