//! The bounded ReAct loop: model -> tool -> tool-result -> model.
//!
//! Tool errors are fed back as tool results so the model can self-correct;
//! three consecutive failures, the iteration cap, or the request deadline
//! end the loop. Tool invocations stream through [`AgentEvents`] for the
//! client-facing event protocol.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use sheetsight_core::models::ToolCallMeta;
use sheetsight_core::{Error, Result};

use crate::llm::{LlmClient, LlmRequest, LlmToolCall};
use crate::prompts::AGENT_FAILURE_MESSAGE;
use crate::tools::{tool_schemas, DataTools};

pub const MAX_ITERATIONS: usize = 10;
pub const MAX_CONSECUTIVE_TOOL_FAILURES: u32 = 3;

/// Streaming sink for loop progress. The chat layer bridges these onto the
/// notifier; tests record them.
#[async_trait]
pub trait AgentEvents: Send + Sync {
    async fn on_token(&self, _token: &str) {}
    async fn on_tool_start(&self, _call_id: &str, _name: &str, _arguments: &Value) {}
    async fn on_tool_end(&self, _call_id: &str, _result: &str) {}
}

/// No-op sink.
pub struct NullEvents;

#[async_trait]
impl AgentEvents for NullEvents {}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub text: String,
    pub trace: Vec<ToolCallMeta>,
}

pub struct ReactAgent<'a> {
    llm: &'a dyn LlmClient,
    tools: &'a DataTools,
    model: &'a str,
    system_prompt: String,
}

impl<'a> ReactAgent<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        tools: &'a DataTools,
        model: &'a str,
        system_prompt: String,
    ) -> Self {
        Self {
            llm,
            tools,
            model,
            system_prompt,
        }
    }

    /// Drive the loop over the given conversation history until a final
    /// answer, a failure threshold, or the deadline.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run(
        &self,
        history: &[Value],
        events: &dyn AgentEvents,
        deadline: Instant,
    ) -> Result<AgentOutcome> {
        let mut messages: Vec<Value> =
            Vec::with_capacity(history.len() + 1 + 2 * MAX_ITERATIONS);
        messages.push(json!({"role": "system", "content": self.system_prompt}));
        messages.extend(history.iter().cloned());

        let mut trace: Vec<ToolCallMeta> = Vec::new();
        let mut consecutive_failures = 0u32;

        for iteration in 0..MAX_ITERATIONS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::message("request deadline exceeded"));
            }

            let request = LlmRequest {
                tools: Some(tool_schemas()),
                temperature: 0.3,
                ..LlmRequest::new(self.model, messages.clone())
            };
            let response = tokio::time::timeout(remaining, self.llm.complete(&request, None))
                .await
                .map_err(|_| Error::message("request deadline exceeded"))??;

            if response.tool_calls.is_empty() {
                tracing::debug!(iteration, "agent produced final answer");
                return Ok(AgentOutcome {
                    text: response.text,
                    trace,
                });
            }

            messages.push(assistant_tool_call_message(
                &response.text,
                &response.tool_calls,
            ));

            for (index, call) in response.tool_calls.into_iter().enumerate() {
                let call_id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{iteration}_{index}"));
                events
                    .on_tool_start(&call_id, &call.name, &call.arguments)
                    .await;

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::message("request deadline exceeded"));
                }
                let result = tokio::time::timeout(
                    remaining,
                    self.tools.execute(&call.name, &call.arguments),
                )
                .await
                .map_err(|_| Error::message("request deadline exceeded"))?;

                events.on_tool_end(&call_id, &result.content).await;
                trace.push(ToolCallMeta {
                    id: call_id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: (!result.is_error).then(|| result.content.clone()),
                    error: result.is_error.then(|| result.content.clone()),
                });

                if result.is_error {
                    consecutive_failures += 1;
                    tracing::debug!(
                        tool = %call.name,
                        consecutive_failures,
                        "tool call failed"
                    );
                } else {
                    consecutive_failures = 0;
                }

                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": result.content,
                }));

                if consecutive_failures >= MAX_CONSECUTIVE_TOOL_FAILURES {
                    tracing::warn!("agent aborted after repeated tool failures");
                    return Ok(AgentOutcome {
                        text: AGENT_FAILURE_MESSAGE.to_string(),
                        trace,
                    });
                }
            }
        }

        tracing::warn!("agent hit the iteration cap without a final answer");
        Ok(AgentOutcome {
            text: AGENT_FAILURE_MESSAGE.to_string(),
            trace,
        })
    }
}

fn assistant_tool_call_message(text: &str, calls: &[LlmToolCall]) -> Value {
    let payloads: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "id": call.id.clone().unwrap_or_else(|| format!("call_{index}")),
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_string(),
                },
            })
        })
        .collect();
    json!({
        "role": "assistant",
        "content": text,
        "tool_calls": payloads,
    })
}
