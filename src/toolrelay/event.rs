//! Orchestration and connection event system.
//!
//! Provides a callback-based observability layer for the engine. Implement
//! [`EventHandler`] to receive real-time notifications about:
//!
//! - **LLM round-trips**: every gateway call inside the orchestration loop
//! - **Tool operations**: dispatch, completion, unknown tool identifiers
//! - **Admission control**: rate limiter waits
//! - **Memory**: summary refreshes
//! - **Server lifecycle**: connects, failed handshakes, disconnects
//!
//! Both methods have default no-op implementations, so you only override what
//! you care about. The handler is shared as `Arc<dyn EventHandler>`; a handler registered
//! on the [`SessionManager`](crate::session_manager::SessionManager) is propagated to every
//! session and server connection it creates.
//!
//! # Event Flow (during a typical `submit_query()` call)
//!
//! ```text
//! QueryStarted
//!   └─ LLMCallStarted { turn: 1 }
//!   └─ LLMCallCompleted { turn: 1, stop_condition: ToolUse }
//!       ├─ ToolCallDispatched
//!       ├─ (RateLimitWait)
//!       └─ ToolCallCompleted
//!   └─ LLMCallStarted { turn: 2 }
//!   └─ LLMCallCompleted { turn: 2, stop_condition: EndTurn }
//! (SummaryUpdated)
//! QueryCompleted
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use toolrelay::event::{EventHandler, OrchestrationEvent};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_orchestration_event(&self, event: &OrchestrationEvent) {
//!         if let OrchestrationEvent::ToolCallCompleted { server_name, tool_name, success, .. } = event {
//!             println!("{}.{} -> {}", server_name, tool_name, success);
//!         }
//!     }
//! }
//! ```

use crate::toolrelay::client_wrapper::StopCondition;
use crate::toolrelay::message::TokenUsage;
use async_trait::async_trait;
use std::time::Duration;

/// Events emitted by an [`OrchestrationSession`](crate::orchestration::OrchestrationSession)
/// while it answers a query.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// A query entered the loop.
    QueryStarted {
        session_id: String,
        /// First ~120 characters of the query.
        query_preview: String,
    },

    /// Fired before each gateway round-trip. `turn` is 1-based.
    LLMCallStarted { session_id: String, turn: usize },

    /// Fired after each gateway round-trip.
    LLMCallCompleted {
        session_id: String,
        turn: usize,
        stop_condition: StopCondition,
        /// Usage reported by the backend for this call, if any.
        tokens_used: Option<TokenUsage>,
    },

    /// A resolved tool call is about to pass admission control.
    ToolCallDispatched {
        session_id: String,
        tool_use_id: String,
        server_name: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool call finished (success or failure).
    ToolCallCompleted {
        session_id: String,
        tool_use_id: String,
        server_name: String,
        tool_name: String,
        success: bool,
        error: Option<String>,
    },

    /// The model asked for a tool identifier the routing table does not know.
    UnknownToolRequested {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
    },

    /// The rate limiter suspended a tool call.
    RateLimitWait { session_id: String, wait: Duration },

    /// The turn ceiling cut the loop short.
    TurnLimitReached { session_id: String, max_turns: usize },

    /// The rolling summary was replaced.
    SummaryUpdated {
        session_id: String,
        summary_length: usize,
    },

    /// The loop reached a terminal state.
    QueryCompleted {
        session_id: String,
        turns: usize,
        tool_calls_made: usize,
        answered: bool,
    },
}

/// Events emitted by a [`ServerConnection`](crate::server_connection::ServerConnection).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        server_name: String,
        tool_count: usize,
    },
    ConnectFailed { server_name: String, error: String },
    Disconnected { server_name: String },
}

/// Receiver for engine events. All methods default to no-ops.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_orchestration_event(&self, _event: &OrchestrationEvent) {}

    async fn on_connection_event(&self, _event: &ConnectionEvent) {}
}
