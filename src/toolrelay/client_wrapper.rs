//! The LLM request gateway.
//!
//! An [`InferenceBackend`] is a wrapper around a specific inference service. It does not keep
//! track of the conversation; the orchestration session owns memory and hands the gateway a
//! validated snapshot on every turn.
//!
//! [`LlmGateway`] adds the per-model-family configuration on top of a backend: output token
//! ceiling, fixed sampling temperature, and whether the family needs a pause between tool
//! batches.
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use toolrelay::client_wrapper::{
//!     InferenceBackend, InferenceRequest, InferenceResponse, LlmGateway, StopCondition,
//! };
//! use toolrelay::message::{ContentPart, Message};
//! use toolrelay::tool_protocol::BoxError;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl InferenceBackend for Echo {
//!     fn model_name(&self) -> &str {
//!         "echo-nova-lite"
//!     }
//!
//!     async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, BoxError> {
//!         let last = request.messages.last().map(|m| m.text()).unwrap_or_default();
//!         Ok(InferenceResponse::new(StopCondition::EndTurn, vec![ContentPart::text(last)]))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let gateway = LlmGateway::new(Arc::new(Echo));
//! assert_eq!(gateway.max_tokens(), 10_000);
//! let response = gateway.complete(&[Message::user("ping")], &[]).await.unwrap();
//! assert_eq!(response.final_text().as_deref(), Some("ping"));
//! # }
//! ```

use crate::toolrelay::message::{ContentPart, Message, TokenUsage};
use crate::toolrelay::tool_protocol::{BoxError, ToolDescriptor};
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Output budget for models outside any known family.
pub const DEFAULT_MAX_TOKENS: usize = 4096;
/// Sampling temperature used for every request.
pub const DEFAULT_TEMPERATURE: f32 = 0.0;

/// Why the backend ended a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// The model wants one or more tools invoked.
    ToolUse,
    /// Natural end of the answer.
    EndTurn,
    /// Output budget exhausted.
    MaxTokens,
    /// A configured stop sequence was produced.
    StopSequence,
    /// The backend filtered or refused the output.
    ContentFiltered,
}

/// One inference call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Structured backend reply.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub stop_condition: StopCondition,
    /// Text and tool-request parts, in the order the model produced them.
    pub content: Vec<ContentPart>,
    pub usage: Option<TokenUsage>,
}

impl InferenceResponse {
    pub fn new(stop_condition: StopCondition, content: Vec<ContentPart>) -> Self {
        Self {
            stop_condition,
            content,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// The last text part, if any.
    pub fn final_text(&self) -> Option<String> {
        self.content
            .iter()
            .rev()
            .find_map(ContentPart::as_text)
            .map(str::to_string)
    }
}

/// Trait defining the interface to an inference service.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Model identifier; drives the family heuristics in [`LlmGateway`].
    fn model_name(&self) -> &str;

    /// Run one inference call.
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, BoxError>;

    /// Usage from the *last* `infer()` call.
    fn get_last_usage(&self) -> Option<TokenUsage> {
        self.usage_slot()
            .and_then(|slot| slot.lock().ok().and_then(|u| u.clone()))
    }

    /// Backends that track usage override this to expose their slot.
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

/// Inference failure as seen by the orchestration loop.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Transport or backend failure.
    Backend(String),
    /// The backend answered with something the loop cannot act on.
    InvalidResponse(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GatewayError::Backend(msg) => write!(f, "Inference backend error: {}", msg),
            GatewayError::InvalidResponse(msg) => write!(f, "Invalid inference response: {}", msg),
        }
    }
}

impl Error for GatewayError {}

/// Output budget for a model identifier.
pub fn max_tokens_for_model(model_id: &str) -> usize {
    let model = model_id.to_lowercase();
    if model.contains("nova") {
        10_000
    } else if ["mistral", "jamba", "pixtral"]
        .iter()
        .any(|family| model.contains(family))
    {
        8192
    } else {
        DEFAULT_MAX_TOKENS
    }
}

/// Families that reject bursts of back-to-back requests.
pub fn is_throttle_sensitive(model_id: &str) -> bool {
    let model = model_id.to_lowercase();
    model.contains("nova") || model.contains("llama")
}

/// Shared entry point to an inference backend.
#[derive(Clone)]
pub struct LlmGateway {
    backend: Arc<dyn InferenceBackend>,
    max_tokens: usize,
    temperature: f32,
}

impl LlmGateway {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        let max_tokens = max_tokens_for_model(backend.model_name());
        Self {
            backend,
            max_tokens,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn is_throttle_sensitive(&self) -> bool {
        is_throttle_sensitive(self.backend.model_name())
    }

    /// Send the conversation and catalog to the backend.
    ///
    /// A `ToolUse` reply that carries no tool request is rejected as
    /// [`GatewayError::InvalidResponse`]; resubmitting it would only repeat the turn.
    pub async fn complete(
        &self,
        messages: &[Message],
        catalog: &[ToolDescriptor],
    ) -> Result<InferenceResponse, GatewayError> {
        let request = InferenceRequest {
            messages: messages.to_vec(),
            tools: catalog.to_vec(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        log::debug!(
            "Sending {} messages and {} tools to {}",
            request.messages.len(),
            request.tools.len(),
            self.backend.model_name()
        );

        let mut response = self
            .backend
            .infer(request)
            .await
            .map_err(|e| GatewayError::Backend(e.to_string()))?;

        if response.stop_condition == StopCondition::ToolUse
            && !response
                .content
                .iter()
                .any(|part| matches!(part, ContentPart::ToolRequest { .. }))
        {
            return Err(GatewayError::InvalidResponse(
                "tool_use stop without any tool request".to_string(),
            ));
        }
        if response.usage.is_none() {
            response.usage = self.backend.get_last_usage();
        }
        Ok(response)
    }
}
