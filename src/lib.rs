//! # toolrelay
//!
//! toolrelay lets a Large Language Model answer natural-language queries by invoking tools
//! exposed by one or more independently running MCP servers, iterating until the model
//! produces a final answer.
//!
//! The crate provides layered abstractions for:
//!
//! * **Conversation state**: [`message::Message`] with a closed set of content parts and a
//!   bounded [`memory::ConversationMemory`] that never resubmits an orphaned tool result
//! * **Tool servers**: [`server_connection::ServerConnection`] manages the lifecycle of one
//!   remote backend over a pluggable [`tool_protocol::ToolTransport`] (MCP over HTTP, or
//!   in-process Rust closures)
//! * **Routing**: [`tool_router::ToolRouter`] flattens every connected server's tools into
//!   one namespaced catalog and maps the model's requests back to `(server, tool)`
//! * **Admission control**: a per-session sliding-window [`rate_limiter::RateLimiter`]
//! * **Inference**: [`client_wrapper::LlmGateway`] over any
//!   [`client_wrapper::InferenceBackend`], with an Anthropic Messages implementation in
//!   [`clients::anthropic`]
//! * **The loop**: [`OrchestrationSession`] drives submit → interpret → dispatch → resubmit,
//!   and [`SessionManager`] exposes sessions to a web or CLI front end
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolrelay::client_wrapper::LlmGateway;
//! use toolrelay::clients::anthropic::AnthropicClient;
//! use toolrelay::config::{McpJsonConfig, RelayConfig};
//! use toolrelay::SessionManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     toolrelay::init_logger();
//!
//!     let api_key = std::env::var("ANTHROPIC_KEY")?;
//!     let gateway = LlmGateway::new(Arc::new(AnthropicClient::new_with_model_str(
//!         &api_key,
//!         "claude-sonnet-4-5",
//!     )));
//!     let manager = SessionManager::new(gateway, RelayConfig::default());
//!
//!     let provider = McpJsonConfig::new("mcp.json");
//!     let session_id = manager.create_session_from_config(&provider, &[]).await?;
//!     for tool in manager.list_catalog(&session_id).await? {
//!         println!("{}: {}", tool.name, tool.description);
//!     }
//!
//!     let answer = manager
//!         .submit_query(&session_id, "Which customers placed more than ten orders?")
//!         .await?;
//!     println!("{}", answer);
//!
//!     manager.teardown_session(&session_id).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding toolrelay can opt in to `RUST_LOG` driven diagnostics without
/// choosing a logging backend upfront.
///
/// ```rust
/// toolrelay::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `toolrelay` module.
pub mod toolrelay;

// Re-exporting key items for easier external access.
pub use toolrelay::client_wrapper;
pub use toolrelay::client_wrapper::{InferenceBackend, LlmGateway, StopCondition};
pub use toolrelay::clients;
pub use toolrelay::config;
pub use toolrelay::config::{ConfigProvider, McpJsonConfig, RelayConfig};
pub use toolrelay::event;
pub use toolrelay::event::{ConnectionEvent, EventHandler, OrchestrationEvent};
pub use toolrelay::http_client_pool;
pub use toolrelay::memory;
pub use toolrelay::memory::ConversationMemory;
pub use toolrelay::message;
pub use toolrelay::message::{ContentPart, Message, Role};
pub use toolrelay::orchestration;
pub use toolrelay::orchestration::{OrchestrationError, OrchestrationSession};
pub use toolrelay::rate_limiter;
pub use toolrelay::server_connection;
pub use toolrelay::server_connection::ServerConnection;
pub use toolrelay::session_manager;
pub use toolrelay::session_manager::SessionManager;
pub use toolrelay::tool_protocol;
pub use toolrelay::tool_protocol::{ToolDescriptor, ToolError};
pub use toolrelay::tool_protocols;
pub use toolrelay::tool_router;
