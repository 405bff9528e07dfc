//! LLM collaborator boundary.
//!
//! The core is provider-agnostic: messages and tool schemas are
//! `serde_json::Value` on the wire, and tool-call payloads coming back are
//! validated into [`LlmToolCall`] at this boundary. [`OpenAiCompatClient`]
//! speaks the chat-completions dialect with hand-parsed SSE streaming;
//! [`ScriptedLlm`] replays a canned script for tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

use sheetsight_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub temperature: f64,
    pub max_tokens: Option<i64>,
    /// Tool schemas in function-call format; `None` disables tool use.
    pub tools: Option<Vec<Value>>,
    pub stream: bool,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            tools: None,
            stream: false,
        }
    }
}

/// A tool invocation requested by the model. `arguments` is the parsed
/// argument object, or the raw string wrapped in `Value::String` when the
/// model produced unparseable JSON (the dispatcher turns that into a
/// tool-error result).
#[derive(Debug, Clone, PartialEq)]
pub struct LlmToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<LlmToolCall>,
    pub finish_reason: Option<String>,
    pub usage: LlmUsage,
}

impl LlmResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some("stop".into()),
            ..Self::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_calls: vec![LlmToolCall {
                id: Some(format!("call_{}", uuid::Uuid::new_v4().simple())),
                name: name.into(),
                arguments,
            }],
            finish_reason: Some("tool_calls".into()),
            ..Self::default()
        }
    }
}

/// Invoked with each streamed content fragment.
pub type ChunkCallback = Box<dyn FnMut(&str) + Send>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: &LlmRequest,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<LlmResponse>;
}

// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn payload(request: &LlmRequest) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": request.stream,
        });
        if let Some(obj) = payload.as_object_mut() {
            if let Some(limit) = request.max_tokens {
                obj.insert("max_tokens".into(), json!(limit));
            }
            if let Some(tools) = &request.tools {
                obj.insert("tools".into(), Value::Array(tools.clone()));
            }
        }
        payload
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(
        &self,
        request: &LlmRequest,
        mut on_chunk: Option<ChunkCallback>,
    ) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&Self::payload(request))
            .send()
            .await
            .map_err(|e| Error::backend("llm request", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "unknown".into());
            return Err(Error::message(format!(
                "llm request failed ({status}): {body}"
            )));
        }

        if request.stream {
            let mut text = String::new();
            let mut accumulator = ToolCallAccumulator::default();
            let mut finish_reason = None;
            let mut usage = LlmUsage::default();
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Error::backend("llm stream", e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(event) = next_sse_event(&mut buffer) {
                    if event == "[DONE]" {
                        return Ok(LlmResponse {
                            text,
                            tool_calls: accumulator.finish(),
                            finish_reason,
                            usage,
                        });
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&event) else {
                        continue;
                    };
                    if let Some(delta) = value.pointer("/choices/0/delta") {
                        if let Some(fragment) = delta.get("content").and_then(Value::as_str) {
                            text.push_str(fragment);
                            if let Some(cb) = on_chunk.as_mut() {
                                cb(fragment);
                            }
                        }
                        accumulator.push_delta(delta);
                    }
                    if let Some(reason) =
                        value.pointer("/choices/0/finish_reason").and_then(Value::as_str)
                    {
                        finish_reason = Some(reason.to_string());
                    }
                    if let Some(new_usage) = parse_usage(&value) {
                        usage = new_usage;
                    }
                }
            }
            Ok(LlmResponse {
                text,
                tool_calls: accumulator.finish(),
                finish_reason,
                usage,
            })
        } else {
            let value: Value = response
                .json()
                .await
                .map_err(|e| Error::backend("llm response parse", e))?;
            let message = value.pointer("/choices/0/message").cloned().unwrap_or_default();
            let text = message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let tool_calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .map(|calls| calls.iter().map(parse_tool_call).collect())
                .unwrap_or_default();
            let finish_reason = value
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(LlmResponse {
                text,
                tool_calls,
                finish_reason,
                usage: parse_usage(&value).unwrap_or_default(),
            })
        }
    }
}

fn parse_tool_call(call: &Value) -> LlmToolCall {
    let raw_args = call
        .pointer("/function/arguments")
        .and_then(Value::as_str)
        .unwrap_or("{}");
    LlmToolCall {
        id: call.get("id").and_then(Value::as_str).map(str::to_string),
        name: call
            .pointer("/function/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        arguments: serde_json::from_str(raw_args)
            .unwrap_or_else(|_| Value::String(raw_args.to_string())),
    }
}

fn parse_usage(value: &Value) -> Option<LlmUsage> {
    let usage = value.get("usage")?;
    Some(LlmUsage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_i64),
        completion_tokens: usage.get("completion_tokens").and_then(Value::as_i64),
    })
}

/// Accumulates streamed tool-call fragments keyed by index. Argument JSON
/// arrives as string fragments and is parsed once the stream ends.
#[derive(Default)]
struct ToolCallAccumulator {
    partial: Vec<(Option<String>, String, String)>, // (id, name, raw args)
}

impl ToolCallAccumulator {
    fn push_delta(&mut self, delta: &Value) {
        let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) else {
            return;
        };
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            while self.partial.len() <= index {
                self.partial.push((None, String::new(), String::new()));
            }
            let slot = &mut self.partial[index];
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                slot.0 = Some(id.to_string());
            }
            if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                slot.1.push_str(name);
            }
            if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                slot.2.push_str(args);
            }
        }
    }

    fn finish(self) -> Vec<LlmToolCall> {
        self.partial
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, raw_args)| LlmToolCall {
                id,
                name,
                arguments: if raw_args.is_empty() {
                    Value::Object(Map::new())
                } else {
                    serde_json::from_str(&raw_args)
                        .unwrap_or_else(|_| Value::String(raw_args))
                },
            })
            .collect()
    }
}

fn next_sse_event(buffer: &mut String) -> Option<String> {
    let (idx, sep_len) = if let Some(idx) = buffer.find("\r\n\r\n") {
        (idx, 4)
    } else if let Some(idx) = buffer.find("\n\n") {
        (idx, 2)
    } else {
        return None;
    };
    let mut event = buffer[..idx].to_string();
    *buffer = buffer[idx + sep_len..].to_string();
    event = event.replace("\r\n", "\n");
    let mut data_lines = Vec::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------

/// Replays a queued sequence of responses; panics never, errors when the
/// script runs dry. Streaming callers receive the scripted text in two
/// fragments so token plumbing is exercised.
#[derive(Default)]
pub struct ScriptedLlm {
    script: tokio::sync::Mutex<std::collections::VecDeque<LlmResponse>>,
    requests: tokio::sync::Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            script: tokio::sync::Mutex::new(responses.into()),
            requests: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn push(&self, response: LlmResponse) {
        self.script.lock().await.push_back(response);
    }

    /// Requests observed so far, in call order.
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        request: &LlmRequest,
        mut on_chunk: Option<ChunkCallback>,
    ) -> Result<LlmResponse> {
        self.requests.lock().await.push(request.clone());
        let response = self
            .script
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| Error::message("scripted llm exhausted"))?;
        if let Some(cb) = on_chunk.as_mut() {
            let text = &response.text;
            if !text.is_empty() {
                let mid = text
                    .char_indices()
                    .nth(text.chars().count() / 2)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let (head, tail) = text.split_at(mid);
                if !head.is_empty() {
                    cb(head);
                }
                if !tail.is_empty() {
                    cb(tail);
                }
            }
        }
        Ok(response)
    }
}
