//! Chat request orchestration: persist the user message, stream the
//! workflow, persist the assistant message, and close the event lifecycle.
//!
//! Per request exactly one `chat:message:started` is emitted, then tokens
//! and tool events, then exactly one terminal `chat:message:completed` or
//! `chat:message:failed`. The assistant message is persisted before
//! `completed` goes out so the client can fetch it by id immediately.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use sheetsight_core::conversation::{to_provider_messages, ConversationService};
use sheetsight_core::events::chat as chat_events;
use sheetsight_core::models::{MessageMetadata, MessageRole};
use sheetsight_core::notify::Notifier;
use sheetsight_core::store::ConnectionStore;
use sheetsight_core::Result;

use crate::react::AgentEvents;
use crate::tools::load_user_connections;
use crate::workflow::ChatWorkflow;

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub text: String,
}

pub struct ChatService {
    conversations: ConversationService,
    connections: Arc<dyn ConnectionStore>,
    workflow: ChatWorkflow,
    notifier: Arc<dyn Notifier>,
    model: String,
}

impl ChatService {
    pub fn new(
        conversations: ConversationService,
        connections: Arc<dyn ConnectionStore>,
        workflow: ChatWorkflow,
        notifier: Arc<dyn Notifier>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            conversations,
            connections,
            workflow,
            notifier,
            model: model.into(),
        }
    }

    /// Handle one user message end to end.
    #[tracing::instrument(level = "info", skip(self, content))]
    pub async fn handle_message(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        deadline: Instant,
    ) -> Result<ChatOutcome> {
        let conversation = match conversation_id {
            Some(id) => self.conversations.get_owned(user_id, id).await?,
            None => self.conversations.create_conversation(user_id, None).await?,
        };
        let user_message = self
            .conversations
            .add_message(
                &conversation.id,
                MessageRole::User,
                content,
                vec![],
                MessageMetadata::default(),
                true,
            )
            .await?;

        self.notifier
            .emit_to_user(
                user_id,
                chat_events::MESSAGE_STARTED,
                json!({ "conversation_id": conversation.id }),
            )
            .await;

        match self.respond(user_id, &conversation.id, deadline).await {
            Ok((assistant_message_id, text)) => {
                self.notifier
                    .emit_to_user(
                        user_id,
                        chat_events::MESSAGE_COMPLETED,
                        json!({
                            "conversation_id": conversation.id,
                            "message_id": assistant_message_id,
                            "content": text,
                        }),
                    )
                    .await;
                Ok(ChatOutcome {
                    conversation_id: conversation.id,
                    user_message_id: user_message.id,
                    assistant_message_id,
                    text,
                })
            }
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation.id,
                    error = %err,
                    "chat request failed"
                );
                self.notifier
                    .emit_to_user(
                        user_id,
                        chat_events::MESSAGE_FAILED,
                        json!({
                            "conversation_id": conversation.id,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn respond(
        &self,
        user_id: &str,
        conversation_id: &str,
        deadline: Instant,
    ) -> Result<(String, String)> {
        let started = Instant::now();
        let history = self.conversations.history(conversation_id).await?;
        let provider_history = to_provider_messages(&history);
        let schemas = load_user_connections(
            user_id,
            &self.connections,
            &self.workflow_rows(),
        )
        .await?;

        let events = StreamBridge {
            notifier: self.notifier.clone(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
        };
        let outcome = self
            .workflow
            .run(&provider_history, &schemas, &events, deadline)
            .await?;

        let metadata = MessageMetadata {
            model: Some(self.model.clone()),
            latency_ms: Some(started.elapsed().as_millis() as i64),
            tool_calls: outcome.trace,
            ..MessageMetadata::default()
        };
        let assistant_message = self
            .conversations
            .add_message(
                conversation_id,
                MessageRole::Assistant,
                &outcome.final_text,
                vec![],
                metadata,
                true,
            )
            .await?;
        Ok((assistant_message.id, outcome.final_text))
    }

    fn workflow_rows(&self) -> Arc<dyn sheetsight_core::store::SheetRowStore> {
        self.workflow.rows()
    }
}

/// Bridges workflow/agent events onto the user's notification room.
struct StreamBridge {
    notifier: Arc<dyn Notifier>,
    user_id: String,
    conversation_id: String,
}

#[async_trait]
impl AgentEvents for StreamBridge {
    async fn on_token(&self, token: &str) {
        self.notifier
            .emit_to_user(
                &self.user_id,
                chat_events::MESSAGE_TOKEN,
                json!({
                    "conversation_id": self.conversation_id,
                    "token": token,
                }),
            )
            .await;
    }

    async fn on_tool_start(&self, call_id: &str, name: &str, arguments: &Value) {
        self.notifier
            .emit_to_user(
                &self.user_id,
                chat_events::MESSAGE_TOOL_START,
                json!({
                    "conversation_id": self.conversation_id,
                    "tool_call_id": call_id,
                    "tool_name": name,
                    "arguments": arguments,
                }),
            )
            .await;
    }

    async fn on_tool_end(&self, call_id: &str, result: &str) {
        self.notifier
            .emit_to_user(
                &self.user_id,
                chat_events::MESSAGE_TOOL_END,
                json!({
                    "conversation_id": self.conversation_id,
                    "tool_call_id": call_id,
                    "result": result,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ScriptedLlm};
    use crate::workflow::ChatWorkflow;
    use sheetsight_core::notify::MemoryNotifier;
    use sheetsight_core::store::{ConversationStore, MemoryDocumentStore};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        notifier: Arc<MemoryNotifier>,
        service: ChatService,
    }

    fn fixture(llm: ScriptedLlm) -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let workflow = ChatWorkflow::new(Arc::new(llm), store.clone(), "model");
        let service = ChatService::new(
            ConversationService::new(store.clone()),
            store.clone(),
            workflow,
            notifier.clone(),
            "model",
        );
        Fixture {
            store,
            notifier,
            service,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn successful_request_emits_started_tokens_completed() {
        let fx = fixture(ScriptedLlm::new(vec![
            LlmResponse::text_only("chat"),
            LlmResponse::text_only("Chào bạn!"),
            LlmResponse::text_only("Chào bạn! Rất vui được giúp."),
        ]));
        let outcome = fx
            .service
            .handle_message("u1", None, "xin chào", deadline())
            .await
            .unwrap();
        assert_eq!(outcome.text, "Chào bạn! Rất vui được giúp.");

        let events = fx.notifier.event_names("user:u1").await;
        assert_eq!(events.first().map(String::as_str), Some(chat_events::MESSAGE_STARTED));
        assert_eq!(
            events.last().map(String::as_str),
            Some(chat_events::MESSAGE_COMPLETED)
        );
        assert!(events
            .iter()
            .any(|e| e == chat_events::MESSAGE_TOKEN));
        assert_eq!(
            events
                .iter()
                .filter(|e| *e == chat_events::MESSAGE_COMPLETED
                    || *e == chat_events::MESSAGE_FAILED)
                .count(),
            1
        );

        // Both messages persisted; the assistant message exists before the
        // completed event carries its id.
        let history = fx.store.list_messages(&outcome.conversation_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].id, outcome.assistant_message_id);
    }

    #[tokio::test]
    async fn llm_outage_emits_failed_terminal_event() {
        // Classifier coerces to unclear on failure, then the clarify call
        // errors out with an exhausted script.
        let fx = fixture(ScriptedLlm::new(vec![]));
        let err = fx
            .service
            .handle_message("u1", None, "hello", deadline())
            .await
            .unwrap_err();
        assert!(!err.to_string().is_empty());

        let events = fx.notifier.event_names("user:u1").await;
        assert_eq!(events.first().map(String::as_str), Some(chat_events::MESSAGE_STARTED));
        assert_eq!(events.last().map(String::as_str), Some(chat_events::MESSAGE_FAILED));
    }

    #[tokio::test]
    async fn second_message_reuses_the_conversation() {
        let fx = fixture(ScriptedLlm::new(vec![
            LlmResponse::text_only("chat"),
            LlmResponse::text_only("one"),
            LlmResponse::text_only("one"),
            LlmResponse::text_only("chat"),
            LlmResponse::text_only("two"),
            LlmResponse::text_only("two"),
        ]));
        let first = fx
            .service
            .handle_message("u1", None, "hi", deadline())
            .await
            .unwrap();
        let second = fx
            .service
            .handle_message("u1", Some(&first.conversation_id), "again", deadline())
            .await
            .unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
        let history = fx.store.list_messages(&first.conversation_id).await.unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_found() {
        let fx = fixture(ScriptedLlm::new(vec![
            LlmResponse::text_only("chat"),
            LlmResponse::text_only("x"),
            LlmResponse::text_only("x"),
        ]));
        let mine = fx
            .service
            .handle_message("u1", None, "hi", deadline())
            .await
            .unwrap();
        let err = fx
            .service
            .handle_message("u2", Some(&mine.conversation_id), "steal", deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, sheetsight_core::Error::NotFound(_)));
    }
}
