//! The multi-turn tool-orchestration loop.
//!
//! An [`OrchestrationSession`] owns everything one conversational context needs: its
//! [`ConversationMemory`], its [`ServerConnection`]s, its [`RateLimiter`], and a handle to the
//! shared [`LlmGateway`]. Nothing in a session is shared with another session, so sessions
//! never synchronize with each other.
//!
//! # The loop
//!
//! ```text
//!  Submitting ──► Interpreting ──► ToolUse ──► Dispatching ──┐
//!      ▲                │                                    │
//!      └────────────────┼────────────────────────────────────┘
//!                       └──► EndTurn | MaxTokens | StopSequence | ContentFiltered ──► Terminal
//! ```
//!
//! On `ToolUse` every content part is scanned first: text becomes a `[Thinking: ..]` transcript
//! line and an assistant message, and each tool request is recorded and queued. The queue is
//! then dispatched sequentially through the rate limiter, so results land in memory in the
//! order the model asked for them. A failing call produces an error tool-result and never
//! aborts its siblings.
//!
//! The loop stops after `max_turns` gateway round-trips even if the model keeps asking for
//! tools.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use toolrelay::client_wrapper::{
//!     InferenceBackend, InferenceRequest, InferenceResponse, LlmGateway, StopCondition,
//! };
//! use toolrelay::config::RelayConfig;
//! use toolrelay::message::ContentPart;
//! use toolrelay::orchestration::OrchestrationSession;
//! use toolrelay::tool_protocol::{BoxError, RawToolResult, ToolDescriptor};
//! use toolrelay::tool_protocols::{tool_fn, LocalToolTransport};
//!
//! struct FortyTwo;
//!
//! #[async_trait]
//! impl InferenceBackend for FortyTwo {
//!     fn model_name(&self) -> &str {
//!         "mock"
//!     }
//!     async fn infer(&self, _request: InferenceRequest) -> Result<InferenceResponse, BoxError> {
//!         Ok(InferenceResponse::new(StopCondition::EndTurn, vec![ContentPart::text("42")]))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let tools = LocalToolTransport::new();
//! tools
//!     .register_tool(
//!         ToolDescriptor::new("noop", "Does nothing", json!({"type": "object", "properties": {}})),
//!         tool_fn(|_args| Ok(RawToolResult::text("ok"))),
//!     )
//!     .await;
//!
//! let mut session = OrchestrationSession::new(
//!     "demo",
//!     LlmGateway::new(Arc::new(FortyTwo)),
//!     RelayConfig::default(),
//! );
//! session.add_server("local", "local://tools", Arc::new(tools));
//! session.connect_all().await;
//!
//! let answer = session.submit_query("What is six times seven?").await.unwrap();
//! assert_eq!(answer, "42");
//! # }
//! ```

use crate::toolrelay::client_wrapper::{GatewayError, LlmGateway, StopCondition};
use crate::toolrelay::config::RelayConfig;
use crate::toolrelay::event::{EventHandler, OrchestrationEvent};
use crate::toolrelay::memory::ConversationMemory;
use crate::toolrelay::message::{ContentPart, Message};
use crate::toolrelay::rate_limiter::{Clock, RateLimiter, TokioClock};
use crate::toolrelay::server_connection::ServerConnection;
use crate::toolrelay::tool_protocol::{ToolDescriptor, ToolError, ToolTransport};
use crate::toolrelay::tool_router::ToolRouter;
use futures_util::future::join_all;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const TOOL_USE_NOTICE: &str = "MCP Client is using tools to help with your query...";
pub const MAX_TOKENS_MARKER: &str = "[Max tokens reached, ending response.]";
pub const STOP_SEQUENCE_MARKER: &str = "[Response complete.]";
pub const CONTENT_FILTERED_MARKER: &str = "[Content filtered, ending response.]";
pub const TURN_LIMIT_MARKER: &str = "\n[Max processing steps reached, ending response.]";

/// Instruction prepended to the conversation when the rolling summary is refreshed.
pub const SUMMARY_INSTRUCTION: &str = "Please provide a brief summary (2-3 sentences) of our conversation so far. Focus on the key questions asked and insights provided.";

/// Summaries are only requested once memory holds at least this many messages.
const MIN_MESSAGES_FOR_SUMMARY: usize = 3;

/// Errors surfaced by a failed session operation.
///
/// Per-tool failures never appear here: they are folded back into the conversation as
/// error tool-results.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    /// The inference call failed; the current query is aborted.
    Gateway(GatewayError),
    /// No server of the session is connected.
    NoServersConnected,
    /// A server name is not registered in the session.
    ServerNotFound(String),
    /// A session id is not known to the manager.
    SessionNotFound(String),
    /// The query exceeded the caller-level timeout.
    Timeout(Duration),
    /// A direct tool or connection operation failed.
    Tool(ToolError),
}

impl fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationError::Gateway(e) => write!(f, "{}", e),
            OrchestrationError::NoServersConnected => {
                write!(f, "Not connected to any MCP servers")
            }
            OrchestrationError::ServerNotFound(name) => write!(f, "Server {} not found", name),
            OrchestrationError::SessionNotFound(id) => write!(f, "Session {} not found", id),
            OrchestrationError::Timeout(after) => {
                write!(f, "Query timed out after {:?}", after)
            }
            OrchestrationError::Tool(e) => write!(f, "{}", e),
        }
    }
}

impl Error for OrchestrationError {}

impl From<GatewayError> for OrchestrationError {
    fn from(e: GatewayError) -> Self {
        OrchestrationError::Gateway(e)
    }
}

impl From<ToolError> for OrchestrationError {
    fn from(e: ToolError) -> Self {
        OrchestrationError::Tool(e)
    }
}

/// One answered query.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub query: String,
    pub response: String,
}

/// A tool request queued during the scan of one response.
struct PendingCall {
    id: String,
    requested_name: String,
    arguments: JsonValue,
    route: Result<(String, String), ToolError>,
}

/// One conversational context.
pub struct OrchestrationSession {
    id: String,
    memory: ConversationMemory,
    connections: Vec<ServerConnection>,
    gateway: LlmGateway,
    rate_limiter: RateLimiter,
    config: RelayConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    history: Vec<Exchange>,
}

impl OrchestrationSession {
    pub fn new(id: impl Into<String>, gateway: LlmGateway, config: RelayConfig) -> Self {
        Self {
            id: id.into(),
            memory: ConversationMemory::new(config.memory_capacity),
            connections: Vec::new(),
            gateway,
            rate_limiter: build_rate_limiter(&config, Arc::new(TokioClock)),
            config,
            event_handler: None,
            history: Vec::new(),
        }
    }

    /// Read rate limiter time from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.rate_limiter = build_rate_limiter(&self.config, clock);
        self
    }

    /// Attach an event handler. Servers registered afterwards report to it as well.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn summary(&self) -> Option<&str> {
        self.memory.summary()
    }

    /// Every answered query, oldest first.
    pub fn history(&self) -> &[Exchange] {
        &self.history
    }

    pub fn connections(&self) -> &[ServerConnection] {
        &self.connections
    }

    pub fn connection(&self, name: &str) -> Option<&ServerConnection> {
        self.connections.iter().find(|c| c.name() == name)
    }

    /// Register a server in `Disconnected` state. Re-registering a name replaces the old
    /// entry after disconnecting it.
    pub async fn register_server(
        &mut self,
        name: &str,
        endpoint: &str,
        transport: Arc<dyn ToolTransport>,
    ) {
        if let Some(index) = self.position(name) {
            let mut old = self.connections.remove(index);
            old.disconnect().await;
        }
        self.add_server(name, endpoint, transport);
    }

    /// Register a server in `Disconnected` state.
    pub fn add_server(&mut self, name: &str, endpoint: &str, transport: Arc<dyn ToolTransport>) {
        let mut connection = ServerConnection::new(name, endpoint, transport);
        if let Some(handler) = &self.event_handler {
            connection = connection.with_event_handler(handler.clone());
        }
        self.connections.push(connection);
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.connections.iter().position(|c| c.name() == name)
    }

    /// Connect every registered server concurrently, returning the names that are now
    /// connected in registration order.
    pub async fn connect_all(&mut self) -> Vec<String> {
        let outcomes = join_all(self.connections.iter_mut().map(|connection| async move {
            let outcome = connection.connect().await;
            (connection.name().to_string(), outcome)
        }))
        .await;

        outcomes
            .into_iter()
            .filter_map(|(name, outcome)| match outcome {
                Ok(()) => Some(name),
                Err(e) => {
                    log::error!("Failed to connect to {}: {}", name, e);
                    None
                }
            })
            .collect()
    }

    /// Connect one server, or reconnect it when it dropped.
    pub async fn connect_server(&mut self, name: &str) -> Result<(), OrchestrationError> {
        let index = self
            .position(name)
            .ok_or_else(|| OrchestrationError::ServerNotFound(name.to_string()))?;
        self.connections[index].connect().await?;
        Ok(())
    }

    /// Disconnect every server. Safe to call repeatedly.
    pub async fn disconnect_all(&mut self) {
        for connection in self.connections.iter_mut() {
            connection.disconnect().await;
        }
    }

    pub fn has_connected_servers(&self) -> bool {
        self.connections.iter().any(ServerConnection::is_connected)
    }

    /// The tool catalog the model would be offered right now.
    pub fn list_catalog(&self) -> Vec<ToolDescriptor> {
        ToolRouter::build_catalog(&self.connections).catalog().to_vec()
    }

    /// Raw tool descriptors of one server, connecting it first when needed.
    pub async fn list_server_tools(
        &mut self,
        name: &str,
    ) -> Result<Vec<ToolDescriptor>, OrchestrationError> {
        let index = self
            .position(name)
            .ok_or_else(|| OrchestrationError::ServerNotFound(name.to_string()))?;
        let connection = &mut self.connections[index];
        if !connection.is_connected() {
            connection.connect().await?;
        }
        Ok(connection.list_tools()?.to_vec())
    }

    /// Invoke a tool on a named server.
    ///
    /// A disconnected server gets one reconnect attempt before the call fails with
    /// `NotConnected`.
    pub async fn call_tool(
        &mut self,
        server_name: &str,
        tool_name: &str,
        arguments: JsonValue,
    ) -> Result<String, OrchestrationError> {
        let index = self
            .position(server_name)
            .ok_or_else(|| OrchestrationError::ServerNotFound(server_name.to_string()))?;
        let connection = &mut self.connections[index];
        if !connection.is_connected() {
            log::warn!("Server {} not connected, attempting to reconnect...", server_name);
            if connection.connect().await.is_err() {
                return Err(ToolError::NotConnected(server_name.to_string()).into());
            }
        }
        Ok(connection.invoke_tool(tool_name, arguments).await?)
    }

    /// Empty memory, summary and history. Connections are untouched.
    pub fn clear_history(&mut self) {
        self.memory.clear();
        self.history.clear();
    }

    async fn emit(&self, event: OrchestrationEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_orchestration_event(&event).await;
        }
    }

    /// Answer one query, invoking tools as the model requests them.
    ///
    /// Returns the transcript: tool activity lines, stop markers and answer text joined
    /// with blank lines.
    pub async fn submit_query(&mut self, query: &str) -> Result<String, OrchestrationError> {
        if !self.has_connected_servers() {
            return Err(OrchestrationError::NoServersConnected);
        }
        log::info!("Session {} processing query", self.id);
        self.emit(OrchestrationEvent::QueryStarted {
            session_id: self.id.clone(),
            query_preview: query.chars().take(120).collect(),
        })
        .await;

        self.memory.append_user(query);
        let mut outgoing = self.memory.snapshot_for_submission();
        if self.memory.has_evicted() && self.memory.summary().is_some() {
            outgoing.insert(0, self.memory.context_message());
        }
        let router = ToolRouter::build_catalog(&self.connections);
        let max_turns = self.config.max_turns.max(1);

        let mut transcript: Vec<String> = Vec::new();
        let mut final_answer: Option<String> = None;
        let mut tool_calls_made = 0;
        let mut turns = 0;

        loop {
            turns += 1;
            self.emit(OrchestrationEvent::LLMCallStarted {
                session_id: self.id.clone(),
                turn: turns,
            })
            .await;
            let response = self.gateway.complete(&outgoing, router.catalog()).await?;
            self.emit(OrchestrationEvent::LLMCallCompleted {
                session_id: self.id.clone(),
                turn: turns,
                stop_condition: response.stop_condition,
                tokens_used: response.usage.clone(),
            })
            .await;

            match response.stop_condition {
                StopCondition::ToolUse => {
                    transcript.push(TOOL_USE_NOTICE.to_string());
                    tool_calls_made += self
                        .run_tool_batch(&router, response.content, &mut outgoing, &mut transcript)
                        .await;
                    if self.gateway.is_throttle_sensitive() && !self.config.throttle_delay.is_zero()
                    {
                        tokio::time::sleep(self.config.throttle_delay).await;
                    }
                }
                StopCondition::EndTurn => {
                    for text in response.content.iter().filter_map(ContentPart::as_text) {
                        transcript.push(text.to_string());
                        final_answer = Some(text.to_string());
                    }
                    break;
                }
                StopCondition::MaxTokens => {
                    transcript.push(MAX_TOKENS_MARKER.to_string());
                    break;
                }
                StopCondition::StopSequence => {
                    transcript.push(STOP_SEQUENCE_MARKER.to_string());
                    break;
                }
                StopCondition::ContentFiltered => {
                    transcript.push(CONTENT_FILTERED_MARKER.to_string());
                    break;
                }
            }

            if turns >= max_turns {
                log::warn!("Session {} reached {} turns", self.id, max_turns);
                transcript.push(TURN_LIMIT_MARKER.to_string());
                self.emit(OrchestrationEvent::TurnLimitReached {
                    session_id: self.id.clone(),
                    max_turns,
                })
                .await;
                break;
            }
        }

        let answered = final_answer.is_some();
        if let Some(answer) = final_answer {
            self.memory.append_assistant(answer);
        }
        self.maybe_refresh_summary().await;

        let response = transcript.join("\n\n");
        self.history.push(Exchange {
            query: query.to_string(),
            response: response.clone(),
        });
        self.emit(OrchestrationEvent::QueryCompleted {
            session_id: self.id.clone(),
            turns,
            tool_calls_made,
            answered,
        })
        .await;
        Ok(response)
    }

    /// Scan one `ToolUse` response, then dispatch its tool requests in order.
    ///
    /// Returns the number of calls actually sent to a server.
    async fn run_tool_batch(
        &mut self,
        router: &ToolRouter,
        content: Vec<ContentPart>,
        outgoing: &mut Vec<Message>,
        transcript: &mut Vec<String>,
    ) -> usize {
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<PendingCall> = Vec::new();

        for part in content {
            match part {
                ContentPart::Text { text } => {
                    transcript.push(format!("[Thinking: {}]", text));
                    self.record(outgoing, Message::assistant(text));
                }
                ContentPart::ToolRequest {
                    id,
                    tool_name,
                    arguments,
                } => {
                    if !seen.insert(id.clone()) {
                        log::warn!("Skipping duplicate tool use id {}", id);
                        continue;
                    }
                    self.record(
                        outgoing,
                        Message::tool_request(id.clone(), tool_name.clone(), arguments.clone()),
                    );
                    let route = router
                        .resolve(&tool_name)
                        .map(|(server, tool)| (server.to_string(), tool.to_string()));
                    pending.push(PendingCall {
                        id,
                        requested_name: tool_name,
                        arguments,
                        route,
                    });
                }
                ContentPart::ToolResult { id, .. } => {
                    log::debug!("Ignoring tool result {} in model output", id);
                }
            }
        }

        let mut dispatched = 0;
        for call in pending {
            let result = match call.route {
                Err(e) => {
                    let error_msg = e.to_string();
                    log::error!("{}", error_msg);
                    transcript.push(format!("[Error: {}]", error_msg));
                    self.emit(OrchestrationEvent::UnknownToolRequested {
                        session_id: self.id.clone(),
                        tool_use_id: call.id.clone(),
                        tool_name: call.requested_name.clone(),
                    })
                    .await;
                    Message::tool_error(call.id, format!("Error: {}", error_msg))
                }
                Ok((server_name, tool_name)) => {
                    dispatched += 1;
                    self.dispatch(call.id, server_name, tool_name, call.arguments, transcript)
                        .await
                }
            };
            self.record(outgoing, result);
        }
        dispatched
    }

    async fn dispatch(
        &mut self,
        id: String,
        server_name: String,
        tool_name: String,
        arguments: JsonValue,
        transcript: &mut Vec<String>,
    ) -> Message {
        self.emit(OrchestrationEvent::ToolCallDispatched {
            session_id: self.id.clone(),
            tool_use_id: id.clone(),
            server_name: server_name.clone(),
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
        })
        .await;

        let waited = self.rate_limiter.admit().await;
        if !waited.is_zero() {
            self.emit(OrchestrationEvent::RateLimitWait {
                session_id: self.id.clone(),
                wait: waited,
            })
            .await;
        }

        log::debug!(
            "Calling MCP tool: {}.{} with args: {}",
            server_name,
            tool_name,
            arguments
        );
        let outcome = self
            .call_tool(&server_name, &tool_name, arguments.clone())
            .await;

        let (message, error) = match outcome {
            Ok(payload) => {
                transcript.push(format!(
                    "[Using {}.{} with parameters {}]",
                    server_name, tool_name, arguments
                ));
                (Message::tool_result(id.clone(), payload), None)
            }
            Err(e) => {
                let error_msg = format!("Error calling tool {}.{}: {}", server_name, tool_name, e);
                log::error!("{}", error_msg);
                transcript.push(format!("[Error: {}]", error_msg));
                (
                    Message::tool_error(id.clone(), format!("Error: {}", error_msg)),
                    Some(error_msg),
                )
            }
        };

        self.emit(OrchestrationEvent::ToolCallCompleted {
            session_id: self.id.clone(),
            tool_use_id: id,
            server_name,
            tool_name,
            success: error.is_none(),
            error,
        })
        .await;
        message
    }

    fn record(&mut self, outgoing: &mut Vec<Message>, message: Message) {
        outgoing.push(message.clone());
        self.memory.append(message);
    }

    /// Refresh the rolling summary when the memory length hits the interval.
    ///
    /// The trigger is the current (post-eviction) buffer length, not a running counter.
    /// Failures are logged and swallowed.
    async fn maybe_refresh_summary(&mut self) {
        let interval = self.config.summary_interval;
        let held = self.memory.len();
        if interval == 0 || held % interval != 0 || held < MIN_MESSAGES_FOR_SUMMARY {
            return;
        }

        let mut request = vec![Message::user(SUMMARY_INSTRUCTION)];
        request.extend(self.memory.snapshot_for_submission());
        match self.gateway.complete(&request, &[]).await {
            Ok(response) => {
                let summary = response
                    .content
                    .iter()
                    .find_map(ContentPart::as_text)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string);
                if let Some(summary) = summary {
                    log::debug!("Updated conversation summary: {}", summary);
                    let summary_length = summary.len();
                    self.memory.set_summary(summary);
                    self.emit(OrchestrationEvent::SummaryUpdated {
                        session_id: self.id.clone(),
                        summary_length,
                    })
                    .await;
                }
            }
            Err(e) => log::error!("Error updating conversation summary: {}", e),
        }
    }
}

fn build_rate_limiter(config: &RelayConfig, clock: Arc<dyn Clock>) -> RateLimiter {
    RateLimiter::with_clock(
        config.rate_limit,
        config.rate_window,
        config.rate_safety_margin,
        clock,
    )
}
