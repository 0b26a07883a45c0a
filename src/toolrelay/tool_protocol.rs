//! Tool Protocol Abstraction Layer
//!
//! This module defines the capability seam between the orchestration engine and remote tool
//! servers. A [`ToolTransport`] knows how to reach a kind of backend and opens a
//! [`RemoteSession`] against one endpoint; the session performs the protocol handshake,
//! lists the remote tool catalog, and forwards invocations.
//!
//! # Architecture
//!
//! ```text
//! ServerConnection → ToolTransport (trait) → RemoteSession (trait) → [MCP over HTTP | Local | user-defined]
//! ```
//!
//! Remote servers report tool outcomes in several shapes (plain text, structured JSON,
//! arbitrary content blocks). [`RawToolResult::normalize`] folds all of them into the single
//! string payload the conversation carries.
//!
//! # Example
//!
//! ```rust
//! use toolrelay::tool_protocol::{RawContent, RawToolResult};
//!
//! let raw = RawToolResult::text("42 rows");
//! assert_eq!(raw.normalize().unwrap(), "42 rows");
//!
//! let failed = RawToolResult {
//!     content: vec![RawContent::Text { text: "relation does not exist".into() }],
//!     structured_content: None,
//!     is_error: true,
//! };
//! assert!(failed.normalize().is_err());
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::error::Error;
use std::fmt;

/// Boxed error used at every capability seam.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Metadata about one remote tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool arguments as reported by the server.
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: JsonValue,
}

impl ToolDescriptor {
    /// Create a descriptor with the supplied identifier, description and schema.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: JsonValue,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// One content block of a raw tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawContent {
    Text {
        text: String,
    },
    /// Images, embedded resources, and any other block kind.
    Other(JsonValue),
}

/// A tool result exactly as the remote server reported it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawToolResult {
    #[serde(default)]
    pub content: Vec<RawContent>,
    #[serde(default, rename = "structuredContent")]
    pub structured_content: Option<JsonValue>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl RawToolResult {
    /// A successful result carrying a single text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![RawContent::Text { text: text.into() }],
            structured_content: None,
            is_error: false,
        }
    }

    /// A successful result carrying only structured content.
    pub fn structured(value: JsonValue) -> Self {
        Self {
            content: Vec::new(),
            structured_content: Some(value),
            is_error: false,
        }
    }

    /// Fold the result into a single string payload.
    ///
    /// Preference order: the first text block, the structured content, the first non-text
    /// block, and finally the whole result serialized. A result flagged as an error becomes
    /// [`ToolError::RemoteToolError`] carrying the same payload.
    pub fn normalize(&self) -> Result<String, ToolError> {
        let payload = self.payload();
        if self.is_error {
            Err(ToolError::RemoteToolError(payload))
        } else {
            Ok(payload)
        }
    }

    fn payload(&self) -> String {
        if let Some(RawContent::Text { text }) = self.content.first() {
            return text.clone();
        }
        if let Some(structured) = &self.structured_content {
            return structured.to_string();
        }
        if let Some(RawContent::Other(value)) = self.content.first() {
            return value.to_string();
        }
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Error types for tool operations
#[derive(Debug, Clone, PartialEq)]
pub enum ToolError {
    /// The target server has no live session.
    NotConnected(String),
    /// The flattened tool identifier does not resolve to any connected server.
    UnknownTool(String),
    /// The remote server reported a failure while executing the tool.
    RemoteToolError(String),
    /// A lower level protocol/transport error occurred.
    ProtocolError(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotConnected(server) => write!(f, "Not connected to {} MCP server", server),
            ToolError::UnknownTool(name) => write!(f, "Unknown tool: {}", name),
            ToolError::RemoteToolError(msg) => write!(f, "Remote tool error: {}", msg),
            ToolError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Information returned by a successful protocol handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
}

/// A kind of backend that can open sessions against endpoints.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Open the underlying channel to `endpoint`. No protocol traffic is required yet.
    async fn open(&self, endpoint: &str) -> Result<Box<dyn RemoteSession>, BoxError>;

    /// Transport identifier (e.g., "mcp-http", "local").
    fn transport_name(&self) -> &str;
}

/// A live channel to one remote tool server.
///
/// Resources are acquired in two layers: the transport channel (on [`ToolTransport::open`])
/// and the protocol session (on [`initialize`](RemoteSession::initialize)). They are
/// released in reverse order through [`end_session`](RemoteSession::end_session) and
/// [`close_transport`](RemoteSession::close_transport).
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Perform the protocol handshake.
    async fn initialize(&mut self) -> Result<ServerInfo, BoxError>;

    /// Fetch the remote tool catalog.
    async fn list_remote_tools(&self) -> Result<Vec<ToolDescriptor>, BoxError>;

    /// Invoke a tool. `Err` means the channel itself failed; a tool-level failure is an
    /// `Ok` result with `is_error` set.
    async fn invoke(&self, tool_name: &str, arguments: JsonValue)
        -> Result<RawToolResult, BoxError>;

    /// Terminate the protocol session.
    async fn end_session(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Release the transport channel.
    async fn close_transport(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}
