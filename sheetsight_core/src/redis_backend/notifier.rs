use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use serde_json::{json, Value};

use crate::notify::Notifier;
use crate::{Error, Result};

/// Channel the gateway processes subscribe on to forward events to
/// connected clients.
pub const GATEWAY_CHANNEL: &str = "sheetsight:gateway";

/// Writer-only broker notifier for worker processes.
///
/// Publishes `{room?, event, payload}` envelopes; the request-handling
/// process holds the transport and fans each envelope out to its room.
/// Workers never learn anything about connection state. Publish failures
/// are logged and swallowed so a broker outage cannot fail a sync.
#[derive(Clone)]
pub struct RedisNotifier {
    manager: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    async fn publish(&self, envelope: Value) {
        let payload = envelope.to_string();
        let mut conn = self.manager.clone();
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(GATEWAY_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to publish gateway event");
        }
    }
}

/// Subscribe to the gateway channel. Request-handling processes drain this
/// stream and forward each envelope to the room's connected clients; this
/// is the read half workers never hold.
pub async fn subscribe_gateway(
    redis_url: &str,
) -> Result<impl Stream<Item = Value> + Send + Unpin> {
    let client =
        redis::Client::open(redis_url).map_err(|e| Error::backend("redis client open", e))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| Error::backend("redis pubsub connect", e))?;
    pubsub
        .subscribe(GATEWAY_CHANNEL)
        .await
        .map_err(|e| Error::backend("redis subscribe", e))?;
    Ok(Box::pin(pubsub.into_on_message().filter_map(|msg| async move {
        let payload = msg.get_payload::<String>().ok()?;
        serde_json::from_str(&payload).ok()
    })))
}

#[async_trait]
impl Notifier for RedisNotifier {
    #[tracing::instrument(level = "debug", skip(self, payload))]
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value) {
        self.publish(json!({ "room": room, "event": event, "payload": payload }))
            .await;
    }

    #[tracing::instrument(level = "debug", skip(self, payload))]
    async fn broadcast(&self, event: &str, payload: Value) {
        self.publish(json!({ "event": event, "payload": payload }))
            .await;
    }
}
