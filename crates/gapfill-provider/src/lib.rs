#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use gapfill_domain::{hash_json, now_utc, ModelCallRecord, ToolCall, ToolResult};
use gapfill_workflow::ModelBinding;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use ulid::Ulid;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    #[must_use]
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    #[must_use]
    pub fn tool_results(results: &[ToolResult]) -> Self {
        Self {
            role: Role::User,
            content: results
                .iter()
                .map(|result| ContentBlock::ToolResult {
                    tool_use_id: result.tool_use_id.clone(),
                    content: result.content.clone(),
                    is_error: result.is_error,
                })
                .collect(),
        }
    }
}

/// Name, description and JSON-schema input contract of one tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRequest {
    pub model_id: String,
    pub max_tokens: u32,
    pub system: String,
    pub tools: Vec<ToolSpec>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ModelResponse {
    #[must_use]
    pub fn end_turn(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
        }
    }

    #[must_use]
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                ContentBlock::Text { .. } | ContentBlock::ToolResult { .. } => None,
            })
            .collect()
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelTurn {
    pub response: ModelResponse,
    pub call: ModelCallRecord,
}

/// A tool-calling language model reached through one request/response round trip per turn.
pub trait ModelBackend {
    fn backend_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, request: &ModelRequest) -> Result<ModelTurn>;
}

/// Build the backend named by a pipeline model binding.
///
/// # Errors
/// Returns an error for an unknown backend or invalid backend params.
pub fn build_model_backend(binding: &ModelBinding) -> Result<Box<dyn ModelBackend>> {
    match binding.backend.as_str() {
        "anthropic" => Ok(Box::new(AnthropicMessagesBackend::from_params(
            &binding.params,
        )?)),
        "scripted" => Ok(Box::new(ScriptedBackend::from_params(&binding.params)?)),
        other => Err(anyhow!("unsupported model backend '{other}'")),
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Respond(ModelResponse),
    Fail(String),
}

/// Deterministic backend that replays a fixed list of turns, then ends its turn.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Read `params.steps`: each entry is a response object or `{ "error": "..." }`.
    ///
    /// # Errors
    /// Returns an error when a step is neither a valid response nor an error entry.
    pub fn from_params(params: &Value) -> Result<Self> {
        let mut steps = Vec::new();
        if let Some(raw_steps) = params.get("steps") {
            let items = raw_steps
                .as_array()
                .ok_or_else(|| anyhow!("scripted backend params.steps must be a list"))?;
            for (index, item) in items.iter().enumerate() {
                if let Some(message) = item.get("error").and_then(Value::as_str) {
                    steps.push(ScriptedStep::Fail(message.to_string()));
                    continue;
                }
                let response: ModelResponse = serde_json::from_value(item.clone())
                    .map_err(|err| anyhow!("scripted step {index} is not a response: {err}"))?;
                steps.push(ScriptedStep::Respond(response));
            }
        }
        Ok(Self::new(steps))
    }

    /// Every request seen so far, in call order.
    ///
    /// # Errors
    /// Returns an error if the request log lock is poisoned.
    pub fn recorded_requests(&self) -> Result<Vec<ModelRequest>> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .map_err(|_| anyhow!("scripted backend request log poisoned"))
    }
}

impl ModelBackend for ScriptedBackend {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    fn complete(&self, request: &ModelRequest) -> Result<ModelTurn> {
        let started_at = now_utc();
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted backend request log poisoned"))?
            .push(request.clone());

        let next = self
            .steps
            .lock()
            .map_err(|_| anyhow!("scripted backend script poisoned"))?
            .pop_front();
        let response = match next {
            Some(ScriptedStep::Respond(response)) => response,
            Some(ScriptedStep::Fail(message)) => return Err(anyhow!(message)),
            None => ModelResponse::end_turn("script exhausted"),
        };

        let request_hash = hash_json(&serde_json::to_value(request)?)?;
        let response_hash = hash_json(&serde_json::to_value(&response)?)?;
        let call = ModelCallRecord {
            model_call_id: Ulid::new(),
            backend_name: self.backend_name().to_string(),
            model_id: request.model_id.clone(),
            request_hash,
            response_hash,
            stop_reason: response.stop_reason.as_str().to_string(),
            latency_ms: Some(0),
            input_tokens: None,
            output_tokens: None,
            started_at,
            ended_at: now_utc(),
        };
        Ok(ModelTurn { response, call })
    }
}

/// Anthropic Messages API with tool use, over blocking HTTP.
#[derive(Debug, Clone)]
pub struct AnthropicMessagesBackend {
    url: String,
    api_key: String,
    timeout_ms: u64,
}

impl AnthropicMessagesBackend {
    /// # Errors
    /// Returns an error when the API key environment variable is missing.
    pub fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(ANTHROPIC_MESSAGES_URL)
            .to_string();
        let env_name = params
            .get("api_key_env")
            .and_then(Value::as_str)
            .unwrap_or("ANTHROPIC_API_KEY");
        let api_key = std::env::var(env_name).map_err(|_| {
            anyhow!("missing env var '{env_name}' required by model params.api_key_env")
        })?;
        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(300_000);
        Ok(Self {
            url,
            api_key,
            timeout_ms,
        })
    }
}

impl ModelBackend for AnthropicMessagesBackend {
    fn backend_name(&self) -> &'static str {
        "anthropic"
    }

    fn complete(&self, request: &ModelRequest) -> Result<ModelTurn> {
        let started_at = now_utc();
        let outbound = json!({
            "model": request.model_id,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "tools": request.tools,
            "messages": request.messages,
        });
        let request_hash = hash_json(&outbound)?;

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();
        let body: Value = match agent
            .post(&self.url)
            .set("content-type", "application/json")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", ANTHROPIC_VERSION)
            .send_json(&outbound)
        {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "model backend http status {code}: {}",
                    truncate(&detail, 500)
                ));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("model backend transport failure: {err}"));
            }
        };

        let response = parse_messages_response(&body)?;
        let response_hash = hash_json(&body)?;
        let ended_at = now_utc();
        let latency_ms = u64::try_from((ended_at - started_at).whole_milliseconds()).ok();
        let usage = body.get("usage");
        let token_count = |field: &str| {
            usage
                .and_then(|usage| usage.get(field))
                .and_then(Value::as_u64)
                .and_then(|count| u32::try_from(count).ok())
        };
        debug!(
            stop_reason = response.stop_reason.as_str(),
            latency_ms, "model turn completed"
        );

        let call = ModelCallRecord {
            model_call_id: Ulid::new(),
            backend_name: self.backend_name().to_string(),
            model_id: request.model_id.clone(),
            request_hash,
            response_hash,
            stop_reason: response.stop_reason.as_str().to_string(),
            latency_ms,
            input_tokens: token_count("input_tokens"),
            output_tokens: token_count("output_tokens"),
            started_at,
            ended_at,
        };
        Ok(ModelTurn { response, call })
    }
}

/// Keep text and tool-use blocks; other block types (e.g. thinking) are dropped.
fn parse_messages_response(body: &Value) -> Result<ModelResponse> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("model response has no content array"))?;
    let mut content = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") | Some("tool_use") => {
                content.push(serde_json::from_value::<ContentBlock>(block.clone())?);
            }
            _ => {}
        }
    }
    let stop_reason = StopReason::parse(
        body.get("stop_reason")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    );
    Ok(ModelResponse {
        content,
        stop_reason,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::{
        build_model_backend, parse_messages_response, ContentBlock, Message, ModelBackend,
        ModelRequest, ModelResponse, ScriptedBackend, ScriptedStep, StopReason,
    };
    use gapfill_domain::ToolResult;
    use gapfill_workflow::ModelBinding;
    use serde_json::json;

    fn fixture_request() -> ModelRequest {
        ModelRequest {
            model_id: "model-x".to_string(),
            max_tokens: 1024,
            system: "fill gaps".to_string(),
            tools: Vec::new(),
            messages: vec![Message::user_text("process AAPL")],
        }
    }

    #[test]
    fn scripted_backend_replays_steps_then_ends_turn() {
        let backend = ScriptedBackend::new(vec![
            ScriptedStep::Respond(ModelResponse {
                content: vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "note_finding".to_string(),
                    input: json!({"category": "decision", "content": "start"}),
                }],
                stop_reason: StopReason::ToolUse,
            }),
            ScriptedStep::Fail("overloaded".to_string()),
        ]);
        let request = fixture_request();

        let first = backend.complete(&request);
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        assert_eq!(first.response.tool_calls().len(), 1);
        assert_eq!(first.call.stop_reason, "tool_use");

        assert!(backend.complete(&request).is_err());

        let third = backend.complete(&request);
        assert!(third.is_ok());
        let third = third.unwrap_or_else(|_| unreachable!());
        assert_eq!(third.response.stop_reason, StopReason::EndTurn);

        let recorded = backend.recorded_requests().unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(recorded.len(), 3);
    }

    #[test]
    fn scripted_backend_reads_steps_from_params() {
        let params = json!({
            "steps": [
                {"content": [{"type": "tool_use", "id": "t1", "name": "web_search", "input": {"query": "q"}}], "stop_reason": "tool_use"},
                {"error": "boom"}
            ]
        });
        let backend = ScriptedBackend::from_params(&params).unwrap_or_else(|err| panic!("{err}"));
        let first = backend.complete(&fixture_request()).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(first.response.tool_calls()[0].name, "web_search");
        assert!(backend.complete(&fixture_request()).is_err());

        assert!(ScriptedBackend::from_params(&json!({"steps": [{"content": 3}]})).is_err());
    }

    #[test]
    fn messages_serialize_with_wire_block_types() {
        let message = Message::tool_results(&[ToolResult::failure("t1", "no_screenshot", "browse first")]);
        let value = serde_json::to_value(&message).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "tool_result");
        assert_eq!(value["content"][0]["is_error"], true);
    }

    #[test]
    fn parses_messages_response_and_skips_unknown_blocks() {
        let body = json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "browsing"},
                {"type": "tool_use", "id": "t9", "name": "browse_financials", "input": {"statement_kind": "income"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let response = parse_messages_response(&body).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.text(), "browsing");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert!(parse_messages_response(&json!({"stop_reason": "end_turn"})).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let binding = ModelBinding {
            backend: "carrier-pigeon".to_string(),
            model_id: "m".to_string(),
            max_tokens: 10,
            params: json!({}),
        };
        assert!(build_model_backend(&binding).is_err());
    }
}
