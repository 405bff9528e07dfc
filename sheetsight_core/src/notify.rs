//! Cross-process client notifications.
//!
//! Two publish paths share one room convention (`user:{user_id}`): request
//! processes emit straight at the connected transport, worker processes
//! publish through the shared broker with a writer-only handle. Both sit
//! behind [`Notifier`]. Emit failures are logged and swallowed here; they
//! must never propagate into sync or chat business logic.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::events::user_room;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value);

    async fn emit_to_user(&self, user_id: &str, event: &str, payload: Value) {
        self.emit_to_room(&user_room(user_id), event, payload).await;
    }

    async fn broadcast(&self, event: &str, payload: Value);
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    /// `None` for broadcasts.
    pub room: Option<String>,
    pub event: String,
    pub payload: Value,
}

/// Recording notifier for development and tests.
#[derive(Default)]
pub struct MemoryNotifier {
    emitted: Mutex<Vec<EmittedEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EmittedEvent> {
        self.emitted.lock().await.clone()
    }

    /// Event names observed in a room, in emit order.
    pub async fn event_names(&self, room: &str) -> Vec<String> {
        self.emitted
            .lock()
            .await
            .iter()
            .filter(|e| e.room.as_deref() == Some(room))
            .map(|e| e.event.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn emit_to_room(&self, room: &str, event: &str, payload: Value) {
        self.emitted.lock().await.push(EmittedEvent {
            room: Some(room.to_string()),
            event: event.to_string(),
            payload,
        });
    }

    async fn broadcast(&self, event: &str, payload: Value) {
        self.emitted.lock().await.push(EmittedEvent {
            room: None,
            event: event.to_string(),
            payload,
        });
    }
}
