use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use sheetsight_core::sync::enqueue_all_enabled;
use sheetsight_core::{error::codes, Error};

use crate::error::ApiError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";
const USER_ID_HEADER: &str = "x-user-id";
/// Overall deadline for one chat request, covering the agent loop and
/// every tool call inside it.
const CHAT_DEADLINE: Duration = Duration::from_secs(120);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/chat", post(send_chat))
        .route("/internal/trigger-sync", post(trigger_sync))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    conversation_id: Option<String>,
    content: String,
}

/// Send a chat message and wait for the assistant's reply. Streaming
/// consumers watch the `chat:message:*` events on the user's room; this
/// response carries the final persisted message. Caller identity comes
/// from the gateway via the `x-user-id` header.
#[tracing::instrument(level = "info", skip_all)]
async fn send_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .ok_or(ApiError::MissingUserId)?
        .to_string();
    if request.content.trim().is_empty() {
        return Err(ApiError::Core(Error::validation(
            codes::BAD_OPERATION,
            "message content cannot be empty",
        )));
    }

    let deadline = tokio::time::Instant::now() + CHAT_DEADLINE;
    let outcome = state
        .chat
        .handle_message(
            &user_id,
            request.conversation_id.as_deref(),
            &request.content,
            deadline,
        )
        .await?;

    Ok(Json(json!({
        "conversation_id": outcome.conversation_id,
        "user_message_id": outcome.user_message_id,
        "message_id": outcome.assistant_message_id,
        "content": outcome.text,
    })))
}

/// Called by the external scheduler. Responds 202 immediately; enqueueing
/// one task per enabled connection happens in a background task.
#[tracing::instrument(level = "info", skip_all)]
async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    verify_api_key(&headers, &state.config.internal_api_key)?;

    let connections = state.connections.clone();
    let queue = state.queue.clone();
    let queue_name = state.config.sync_queue.clone();
    tokio::spawn(async move {
        if let Err(err) = enqueue_all_enabled(&connections, &queue, &queue_name).await {
            tracing::error!(error = %err, "failed to enqueue sync tasks");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    ))
}

/// Compare the presented key against the configured one in constant time by
/// comparing digests rather than the raw strings.
fn verify_api_key(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingApiKey)?;
    let presented_hash = Sha256::digest(presented.as_bytes());
    let expected_hash = Sha256::digest(expected.as_bytes());
    if presented_hash == expected_hash {
        Ok(())
    } else {
        Err(ApiError::InvalidApiKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use sheetsight_agent::chat::ChatService;
    use sheetsight_agent::llm::{LlmResponse, ScriptedLlm};
    use sheetsight_agent::workflow::ChatWorkflow;
    use sheetsight_core::config::AppConfig;
    use sheetsight_core::conversation::ConversationService;
    use sheetsight_core::models::Connection;
    use sheetsight_core::notify::MemoryNotifier;
    use sheetsight_core::queue::{MemoryTaskQueue, TaskQueue};
    use sheetsight_core::store::{ConnectionStore, MemoryDocumentStore};
    use tower::ServiceExt;

    fn test_config() -> AppConfig {
        AppConfig {
            redis_url: "redis://127.0.0.1:6379".into(),
            sync_queue: "q".into(),
            sheets_token: "t".into(),
            sheets_contact: "svc@example.com".into(),
            internal_api_key: "secret-key".into(),
            llm_api_base: "https://api.openai.com/v1".into(),
            llm_api_key: "k".into(),
            llm_model: "gpt-4o-mini".into(),
            rate_safety_factor: 0.8,
        }
    }

    async fn state_with_connections() -> (Arc<AppState>, Arc<MemoryTaskQueue>) {
        state_with_llm(ScriptedLlm::new(vec![
            LlmResponse::text_only("chat"),
            LlmResponse::text_only("Chào bạn!"),
            LlmResponse::text_only("Chào bạn!"),
        ]))
        .await
    }

    async fn state_with_llm(llm: ScriptedLlm) -> (Arc<AppState>, Arc<MemoryTaskQueue>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let now = Utc::now();
        for (id, enabled) in [("c1", true), ("c2", true), ("c3", false)] {
            store
                .insert_connection(Connection {
                    id: id.into(),
                    user_id: "u1".into(),
                    sheet_id: "s1".into(),
                    tab_name: "Orders".into(),
                    column_mappings: vec![],
                    header_row: 1,
                    data_start_row: 2,
                    sync_enabled: enabled,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let workflow = ChatWorkflow::new(Arc::new(llm), store.clone(), "model");
        let chat = Arc::new(ChatService::new(
            ConversationService::new(store.clone()),
            store.clone(),
            workflow,
            Arc::new(MemoryNotifier::new()),
            "model",
        ));
        let state = Arc::new(AppState {
            config: test_config(),
            connections: store,
            queue: queue.clone(),
            chat,
        });
        (state, queue)
    }

    #[tokio::test]
    async fn chat_route_requires_identity_and_answers() {
        let (state, _) = state_with_connections().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "xin chào"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::post("/api/chat")
                    .header("content-type", "application/json")
                    .header("x-user-id", "u1")
                    .body(Body::from(r#"{"content": "xin chào"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["content"], json!("Chào bạn!"));
        assert!(parsed["conversation_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let (state, _) = state_with_connections().await;
        let response = router(state)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_sync_requires_the_key() {
        let (state, _) = state_with_connections().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/internal/trigger-sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::post("/internal/trigger-sync")
                    .header("x-api-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn trigger_sync_enqueues_enabled_connections() {
        let (state, queue) = state_with_connections().await;
        let response = router(state)
            .oneshot(
                Request::post("/internal/trigger-sync")
                    .header("x-api-key", "secret-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], json!("accepted"));

        // Enqueueing runs in the background; give it a beat.
        tokio::task::yield_now().await;
        let mut waited = 0;
        while queue.len("q").await.unwrap() < 2 && waited < 50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(queue.len("q").await.unwrap(), 2);
    }
}
