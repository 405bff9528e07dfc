//! The chat workflow as an explicit state machine.
//!
//! `classify -> {chat | data_agent | clarify} -> format`. Intent
//! classification is one model call whose output is coerced into
//! [`Intent`]; the data-agent branch runs the ReAct loop with the five
//! data-query tools; the formatter normalizes whichever branch answered
//! (numbers as `1.000.000`, percentages as `15,5%`, Vietnamese responses)
//! and is the node whose tokens stream to the client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use sheetsight_core::models::ToolCallMeta;
use sheetsight_core::store::SheetRowStore;
use sheetsight_core::{Error, Result};

use crate::llm::{ChunkCallback, LlmClient, LlmRequest};
use crate::prompts::{
    data_agent_prompt, CHAT_NODE_PROMPT, CLARIFY_NODE_PROMPT, INTENT_CLASSIFIER_PROMPT,
    NO_CONNECTIONS_MESSAGE, RESPONSE_FORMATTER_PROMPT,
};
use crate::react::{AgentEvents, ReactAgent};
use crate::tools::{format_schema_context, ConnectionSchema, DataTools};

/// Independent timeout for each single model call in the workflow.
pub const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const CONTEXT_MESSAGES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    DataQuery,
    Chat,
    Unclear,
}

impl Intent {
    /// Coerce a raw classifier output; anything unrecognised is unclear.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "data_query" => Self::DataQuery,
            "chat" => Self::Chat,
            _ => Self::Unclear,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataQuery => "data_query",
            Self::Chat => "chat",
            Self::Unclear => "unclear",
        }
    }
}

/// Workflow progress, driven by model output and tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Classifying,
    Chatting,
    Clarifying,
    AgentThinking,
    Formatting,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub intent: Intent,
    pub final_text: String,
    pub trace: Vec<ToolCallMeta>,
}

pub struct ChatWorkflow {
    llm: Arc<dyn LlmClient>,
    rows: Arc<dyn SheetRowStore>,
    model: String,
}

impl ChatWorkflow {
    pub fn new(llm: Arc<dyn LlmClient>, rows: Arc<dyn SheetRowStore>, model: impl Into<String>) -> Self {
        Self {
            llm,
            rows,
            model: model.into(),
        }
    }

    /// Row store the per-request tool sets read from.
    pub fn rows(&self) -> Arc<dyn SheetRowStore> {
        self.rows.clone()
    }

    /// Run one request through the graph. `history` is the conversation in
    /// provider message form, newest last.
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn run(
        &self,
        history: &[Value],
        connections: &[ConnectionSchema],
        events: &dyn AgentEvents,
        deadline: Instant,
    ) -> Result<WorkflowOutcome> {
        let mut phase = Phase::Classifying;
        tracing::debug!(?phase, "workflow started");

        let intent = self.classify(history, deadline).await;
        tracing::info!(intent = intent.as_str(), "intent classified");

        let (raw_response, trace) = match intent {
            Intent::DataQuery => {
                phase = Phase::AgentThinking;
                tracing::debug!(?phase, "running data agent");
                if connections.is_empty() {
                    (NO_CONNECTIONS_MESSAGE.to_string(), Vec::new())
                } else {
                    let tools = DataTools::new(connections.to_vec(), self.rows.clone());
                    let prompt = data_agent_prompt(&format_schema_context(connections));
                    let agent = ReactAgent::new(self.llm.as_ref(), &tools, &self.model, prompt);
                    let outcome = agent.run(&recent(history), events, deadline).await?;
                    (outcome.text, outcome.trace)
                }
            }
            Intent::Chat => {
                phase = Phase::Chatting;
                tracing::debug!(?phase, "running chat branch");
                let text = self
                    .single_call(CHAT_NODE_PROMPT, &recent(history), 0.7, None, deadline)
                    .await?;
                (text, Vec::new())
            }
            Intent::Unclear => {
                phase = Phase::Clarifying;
                tracing::debug!(?phase, "running clarify branch");
                let text = self
                    .single_call(CLARIFY_NODE_PROMPT, &recent(history), 0.7, None, deadline)
                    .await?;
                (text, Vec::new())
            }
        };

        phase = Phase::Formatting;
        tracing::debug!(?phase, "formatting response");
        let final_text = self
            .format_response(history, &raw_response, events, deadline)
            .await;

        phase = Phase::Done;
        tracing::debug!(?phase, "workflow finished");
        Ok(WorkflowOutcome {
            intent,
            final_text,
            trace,
        })
    }

    async fn classify(&self, history: &[Value], deadline: Instant) -> Intent {
        let Some(question) = last_user_content(history) else {
            tracing::warn!("no user message to classify");
            return Intent::Unclear;
        };
        let context = conversation_context(history);
        let prompt = if context.is_empty() {
            format!("<message_to_classify>\n{question}\n</message_to_classify>\n\nClassify the message above.")
        } else {
            format!(
                "<conversation_history>\n{context}\n</conversation_history>\n\n\
                 <message_to_classify>\n{question}\n</message_to_classify>\n\n\
                 Classify the message above based on its content and conversation context."
            )
        };
        let messages = vec![
            json!({"role": "system", "content": INTENT_CLASSIFIER_PROMPT}),
            json!({"role": "user", "content": prompt}),
        ];
        let request = LlmRequest {
            temperature: 0.0,
            ..LlmRequest::new(&self.model, messages)
        };
        match self.bounded_complete(&request, None, deadline).await {
            Ok(response) => Intent::parse(&response.text),
            // Classification failure falls through to the clarify branch.
            Err(err) => {
                tracing::warn!(error = %err, "intent classification failed");
                Intent::Unclear
            }
        }
    }

    async fn single_call(
        &self,
        system_prompt: &str,
        history: &[Value],
        temperature: f64,
        on_chunk: Option<ChunkCallback>,
        deadline: Instant,
    ) -> Result<String> {
        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        messages.extend(history.iter().cloned());
        let request = LlmRequest {
            temperature,
            stream: on_chunk.is_some(),
            ..LlmRequest::new(&self.model, messages)
        };
        let response = self.bounded_complete(&request, on_chunk, deadline).await?;
        Ok(response.text)
    }

    /// Normalize the branch output for the user. Formatter tokens are the
    /// ones streamed to the client; a formatter failure falls back to the
    /// unformatted branch text rather than failing the request.
    async fn format_response(
        &self,
        history: &[Value],
        raw_response: &str,
        events: &dyn AgentEvents,
        deadline: Instant,
    ) -> String {
        let question = last_user_content(history).unwrap_or_default();
        let prompt = format!(
            "Câu hỏi của người dùng: {question}\n\nKết quả cần format:\n{raw_response}\n\n\
             Hãy format kết quả trên theo quy tắc đã cho."
        );
        let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let on_chunk: ChunkCallback = Box::new(move |chunk| {
            let _ = chunk_tx.send(chunk.to_string());
        });

        let format_messages = vec![json!({"role": "user", "content": prompt})];
        let call = self.single_call(
            RESPONSE_FORMATTER_PROMPT,
            &format_messages,
            0.3,
            Some(on_chunk),
            deadline,
        );
        tokio::pin!(call);

        // Forward token chunks while the call runs.
        let mut formatted: Option<Result<String>> = None;
        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some(token) => events.on_token(&token).await,
                    None => break,
                },
                result = &mut call, if formatted.is_none() => {
                    formatted = Some(result);
                }
            }
        }
        match formatted {
            Some(Ok(text)) if !text.trim().is_empty() => text,
            Some(Err(err)) => {
                tracing::warn!(error = %err, "response formatting failed, returning raw text");
                raw_response.to_string()
            }
            _ => raw_response.to_string(),
        }
    }

    async fn bounded_complete(
        &self,
        request: &LlmRequest,
        on_chunk: Option<ChunkCallback>,
        deadline: Instant,
    ) -> Result<crate::llm::LlmResponse> {
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .min(MODEL_CALL_TIMEOUT);
        if remaining.is_zero() {
            return Err(Error::message("request deadline exceeded"));
        }
        tokio::time::timeout(remaining, self.llm.complete(request, on_chunk))
            .await
            .map_err(|_| Error::message("model call timed out"))?
    }
}

fn last_user_content(history: &[Value]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|m| m.get("content").and_then(Value::as_str))
        .map(str::to_string)
}

fn conversation_context(history: &[Value]) -> String {
    let parts: Vec<String> = history
        .iter()
        .rev()
        .take(CONTEXT_MESSAGES)
        .filter_map(|m| {
            let role = m.get("role").and_then(Value::as_str)?;
            let content = m.get("content").and_then(Value::as_str)?;
            if content.is_empty() || role == "tool" {
                None
            } else {
                Some(format!("{role}: {content}"))
            }
        })
        .collect();
    parts.into_iter().rev().collect::<Vec<_>>().join("\n")
}

/// Recent history window handed to the branch nodes.
fn recent(history: &[Value]) -> Vec<Value> {
    let skip = history.len().saturating_sub(10);
    history
        .iter()
        .skip(skip)
        .filter(|m| {
            // Branch nodes see plain user/assistant turns only.
            matches!(
                m.get("role").and_then(Value::as_str),
                Some("user") | Some("assistant")
            ) && m.get("tool_calls").is_none()
        })
        .cloned()
        .collect()
}
