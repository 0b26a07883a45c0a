//! Anthropic Messages API backend.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use toolrelay::client_wrapper::LlmGateway;
//! use toolrelay::clients::anthropic::AnthropicClient;
//! use toolrelay::message::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("ANTHROPIC_KEY")?;
//!     let gateway = LlmGateway::new(Arc::new(AnthropicClient::new_with_model_str(
//!         &key,
//!         "claude-sonnet-4-5",
//!     )));
//!     let reply = gateway.complete(&[Message::user("Hello")], &[]).await?;
//!     println!("{:?}", reply.final_text());
//!     Ok(())
//! }
//! ```

use crate::toolrelay::client_wrapper::{
    InferenceBackend, InferenceRequest, InferenceResponse, StopCondition,
};
use crate::toolrelay::http_client_pool::get_or_create_client;
use crate::toolrelay::message::{ContentPart, Role, TokenUsage};
use crate::toolrelay::tool_protocol::BoxError;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for the Anthropic Messages API.
pub struct AnthropicClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    usage: Mutex<Option<TokenUsage>>,
}

impl AnthropicClient {
    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, ANTHROPIC_BASE_URL)
    }

    /// Create a client pointing at a custom Messages-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        AnthropicClient {
            api_key: secret_key.to_string(),
            model: model_name.to_string(),
            client: get_or_create_client(&base_url, REQUEST_TIMEOUT),
            base_url,
            usage: Mutex::new(None),
        }
    }
}

#[async_trait]
impl InferenceBackend for AnthropicClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, BoxError> {
        let body = encode_request(&self.model, &request);
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(format!("Anthropic API returned {}: {}", status, text).into());
        }

        let value: JsonValue = serde_json::from_str(&text)?;
        let decoded = decode_response(&value)?;
        if let Ok(mut slot) = self.usage.lock() {
            *slot = decoded.usage.clone();
        }
        Ok(decoded)
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

/// Build the Messages API request body.
///
/// Consecutive messages with the same role are merged into one API message, so a run of
/// tool requests and the run of results answering them each travel as a single turn.
/// The body always opens with a user turn: leading assistant messages are dropped, and so
/// is any `tool_result` whose `tool_use` was not sent ahead of it.
pub fn encode_request(model: &str, request: &InferenceRequest) -> JsonValue {
    let mut messages: Vec<(Role, Vec<JsonValue>)> = Vec::new();
    let mut sent_tool_uses: HashSet<&str> = HashSet::new();
    for message in &request.messages {
        if messages.is_empty() && message.role == Role::Assistant {
            continue;
        }
        let mut blocks = Vec::with_capacity(message.content.len());
        for part in &message.content {
            match part {
                ContentPart::ToolRequest { id, .. } => {
                    sent_tool_uses.insert(id.as_str());
                }
                ContentPart::ToolResult { id, .. } if !sent_tool_uses.contains(id.as_str()) => {
                    log::warn!("Dropping tool_result {} without a preceding tool_use", id);
                    continue;
                }
                _ => {}
            }
            blocks.push(encode_part(part));
        }
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((role, content)) if *role == message.role => content.extend(blocks),
            _ => messages.push((message.role, blocks)),
        }
    }

    let messages: Vec<JsonValue> = messages
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
    }
    body
}

fn encode_part(part: &ContentPart) -> JsonValue {
    match part {
        ContentPart::Text { text } => json!({"type": "text", "text": text}),
        ContentPart::ToolRequest {
            id,
            tool_name,
            arguments,
        } => json!({"type": "tool_use", "id": id, "name": tool_name, "input": arguments}),
        ContentPart::ToolResult {
            id,
            payload,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": id,
            "content": payload,
            "is_error": is_error,
        }),
    }
}

/// Parse a Messages API response body.
pub fn decode_response(body: &JsonValue) -> Result<InferenceResponse, BoxError> {
    let stop_condition = match body["stop_reason"].as_str() {
        Some("tool_use") => StopCondition::ToolUse,
        Some("end_turn") | Some("pause_turn") => StopCondition::EndTurn,
        Some("max_tokens") => StopCondition::MaxTokens,
        Some("stop_sequence") => StopCondition::StopSequence,
        Some("refusal") => StopCondition::ContentFiltered,
        other => return Err(format!("unexpected stop_reason: {:?}", other).into()),
    };

    let blocks = body["content"]
        .as_array()
        .ok_or("response has no content array")?;
    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => content.push(ContentPart::text(
                block["text"].as_str().unwrap_or_default(),
            )),
            Some("tool_use") => {
                let id = block["id"].as_str().ok_or("tool_use block without id")?;
                let name = block["name"].as_str().ok_or("tool_use block without name")?;
                content.push(ContentPart::ToolRequest {
                    id: id.to_string(),
                    tool_name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            other => log::debug!("Ignoring content block of type {:?}", other),
        }
    }

    let mut response = InferenceResponse::new(stop_condition, content);
    if let Some(usage) = body.get("usage") {
        let input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as usize;
        let output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as usize;
        response = response.with_usage(TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        });
    }
    Ok(response)
}
