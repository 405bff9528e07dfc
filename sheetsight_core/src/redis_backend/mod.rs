//! Redis-backed collaborator implementations: cache, sync-task queue, and
//! the writer-only notifier used by worker processes.

pub mod cache;
pub mod notifier;
pub mod queue;

pub use cache::RedisCache;
pub use notifier::{subscribe_gateway, RedisNotifier};
pub use queue::RedisTaskQueue;

use crate::{Error, Result};

/// Open a managed connection. The manager reconnects on failure, so handles
/// built at startup survive broker restarts.
pub async fn connect(url: &str) -> Result<redis::aio::ConnectionManager> {
    let client =
        redis::Client::open(url).map_err(|e| Error::backend("redis client open", e))?;
    redis::aio::ConnectionManager::new(client)
        .await
        .map_err(|e| Error::backend("redis connect", e))
}
