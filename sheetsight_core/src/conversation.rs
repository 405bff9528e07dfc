//! Conversation and message management on top of the conversation store:
//! auto-generated titles, ownership checks, soft-delete, and conversion to
//! and from provider-facing chat messages.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::{
    Attachment, Conversation, ConversationStatus, Message, MessageMetadata, MessageRole,
    ToolCallMeta,
};
use crate::store::ConversationStore;
use crate::{Error, Result};

pub const DEFAULT_TITLE: &str = "New Conversation";
pub const MAX_TITLE_CHARS: usize = 50;

#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
}

impl ConversationService {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            status: ConversationStatus::Active,
            message_count: 0,
            last_message_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store.insert_conversation(conversation.clone()).await?;
        Ok(conversation)
    }

    /// Missing and not-owned conversations both answer not-found, so a
    /// caller cannot probe for other users' conversation ids.
    pub async fn get_owned(&self, user_id: &str, conversation_id: &str) -> Result<Conversation> {
        self.store
            .find_conversation(conversation_id, false)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| Error::NotFound("conversation not found".into()))
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.store.list_conversations(user_id).await
    }

    pub async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.store.list_messages(conversation_id).await
    }

    #[tracing::instrument(level = "debug", skip(self, content, attachments, metadata))]
    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        attachments: Vec<Attachment>,
        metadata: MessageMetadata,
        is_complete: bool,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            attachments,
            metadata,
            is_complete,
            created_at: Utc::now(),
            deleted_at: None,
        };
        self.store.append_message(message.clone()).await?;

        if role == MessageRole::User {
            self.maybe_title_from_first_message(conversation_id, content)
                .await?;
        }
        Ok(message)
    }

    async fn maybe_title_from_first_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<()> {
        let Some(conversation) = self.store.find_conversation(conversation_id, false).await?
        else {
            return Ok(());
        };
        if conversation.title == DEFAULT_TITLE && conversation.message_count == 1 {
            let title = title_from_content(content);
            self.store
                .update_conversation_title(conversation_id, &title)
                .await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        self.get_owned(user_id, conversation_id).await?;
        self.store.soft_delete_conversation(conversation_id).await?;
        Ok(())
    }
}

/// Derive a conversation title from the first user message: trimmed, cut to
/// 50 characters at a word boundary.
pub fn title_from_content(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }
    let head: String = chars[..MAX_TITLE_CHARS].iter().collect();
    match head.rsplit_once(' ') {
        Some((words, _)) if !words.trim().is_empty() => words.trim_end().to_string(),
        _ => head,
    }
}

/// Stored message -> provider chat message.
///
/// Assistant tool calls and tool-result correlation ids survive the trip in
/// both directions.
pub fn to_provider_message(message: &Message) -> Value {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    };
    let mut out = Map::new();
    out.insert("role".into(), json!(role));
    out.insert("content".into(), json!(message.content));
    if message.role == MessageRole::Assistant && !message.metadata.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .metadata
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    },
                })
            })
            .collect();
        out.insert("tool_calls".into(), Value::Array(calls));
    }
    if message.role == MessageRole::Tool {
        if let Some(id) = &message.metadata.tool_call_id {
            out.insert("tool_call_id".into(), json!(id));
        }
    }
    Value::Object(out)
}

pub fn to_provider_messages(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(to_provider_message).collect()
}

/// Provider chat message -> stored message. Unknown roles fall back to user.
pub fn from_provider_message(conversation_id: &str, value: &Value) -> Message {
    let role = match value.get("role").and_then(Value::as_str) {
        Some("assistant") => MessageRole::Assistant,
        Some("system") => MessageRole::System,
        Some("tool") => MessageRole::Tool,
        _ => MessageRole::User,
    };
    let content = value
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = value
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCallMeta {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(Value::Null),
                    result: None,
                    error: None,
                })
                .collect()
        })
        .unwrap_or_default();
    let tool_call_id = value
        .get("tool_call_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        role,
        content,
        attachments: vec![],
        metadata: MessageMetadata {
            tool_calls,
            tool_call_id,
            ..MessageMetadata::default()
        },
        is_complete: true,
        created_at: Utc::now(),
        deleted_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    fn service() -> (Arc<MemoryDocumentStore>, ConversationService) {
        let store = Arc::new(MemoryDocumentStore::new());
        let service = ConversationService::new(store.clone());
        (store, service)
    }

    #[tokio::test]
    async fn first_user_message_sets_the_title_once() {
        let (_, service) = service();
        let conversation = service.create_conversation("u1", None).await.unwrap();
        assert_eq!(conversation.title, DEFAULT_TITLE);

        let long = "Doanh thu Shopee tháng này so với tháng trước như thế nào, có tăng không?";
        service
            .add_message(
                &conversation.id,
                MessageRole::User,
                long,
                vec![],
                MessageMetadata::default(),
                true,
            )
            .await
            .unwrap();
        let titled = service.get_owned("u1", &conversation.id).await.unwrap();
        assert_ne!(titled.title, DEFAULT_TITLE);
        assert!(titled.title.chars().count() <= MAX_TITLE_CHARS);
        assert!(long.starts_with(&titled.title));

        service
            .add_message(
                &conversation.id,
                MessageRole::User,
                "another message entirely",
                vec![],
                MessageMetadata::default(),
                true,
            )
            .await
            .unwrap();
        let after = service.get_owned("u1", &conversation.id).await.unwrap();
        assert_eq!(after.title, titled.title);
        assert_eq!(after.message_count, 2);
    }

    #[tokio::test]
    async fn ownership_mismatch_is_not_found() {
        let (_, service) = service();
        let conversation = service.create_conversation("u1", None).await.unwrap();
        let err = service.get_owned("u2", &conversation.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_orders_by_update_recency() {
        let (_, service) = service();
        let first = service.create_conversation("u1", Some("first")).await.unwrap();
        let second = service.create_conversation("u1", Some("second")).await.unwrap();
        service
            .add_message(
                &first.id,
                MessageRole::User,
                "bump",
                vec![],
                MessageMetadata::default(),
                true,
            )
            .await
            .unwrap();
        let listed = service.list("u1").await.unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn provider_message_round_trip() {
        let original = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            role: MessageRole::Assistant,
            content: "calling a tool".into(),
            attachments: vec![],
            metadata: MessageMetadata {
                tool_calls: vec![ToolCallMeta {
                    id: "call_1".into(),
                    name: "aggregate_data".into(),
                    arguments: json!({"connection_name": "Orders", "operation": "sum"}),
                    result: None,
                    error: None,
                }],
                ..MessageMetadata::default()
            },
            is_complete: true,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let provider = to_provider_message(&original);
        let back = from_provider_message("c1", &provider);
        assert_eq!(back.role, original.role);
        assert_eq!(back.content, original.content);
        assert_eq!(back.metadata.tool_calls, original.metadata.tool_calls);

        let tool_msg = Message {
            id: "m2".into(),
            conversation_id: "c1".into(),
            role: MessageRole::Tool,
            content: "{\"results\": []}".into(),
            attachments: vec![],
            metadata: MessageMetadata {
                tool_call_id: Some("call_1".into()),
                ..MessageMetadata::default()
            },
            is_complete: true,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let provider = to_provider_message(&tool_msg);
        let back = from_provider_message("c1", &provider);
        assert_eq!(back.metadata.tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn soft_delete_cascades_and_hides() {
        let (store, service) = service();
        let conversation = service.create_conversation("u1", None).await.unwrap();
        service
            .add_message(
                &conversation.id,
                MessageRole::User,
                "hello",
                vec![],
                MessageMetadata::default(),
                true,
            )
            .await
            .unwrap();
        service.delete("u1", &conversation.id).await.unwrap();
        assert!(service.list("u1").await.unwrap().is_empty());
        assert!(service.history(&conversation.id).await.unwrap().is_empty());
        // Still retrievable by id with include_deleted.
        assert!(store
            .find_conversation(&conversation.id, true)
            .await
            .unwrap()
            .is_some());
    }
}
