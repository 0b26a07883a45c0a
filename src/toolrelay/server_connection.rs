//! Lifecycle and capability cache for one remote tool backend.
//!
//! A [`ServerConnection`] starts `Disconnected`, moves to `Connecting` while the transport is
//! opened and the handshake runs, and becomes `Connected` once the tool catalog has been
//! fetched. Any failure on the way tears down whatever was acquired and falls back to
//! `Disconnected`; a half-open session handle is never retained.
//!
//! Connections are exclusively owned by one orchestration session, so `invoke_tool` never
//! races with another session's `connect`/`disconnect`.

use crate::toolrelay::event::{ConnectionEvent, EventHandler};
use crate::toolrelay::tool_protocol::{
    BoxError, RemoteSession, ServerInfo, ToolDescriptor, ToolError, ToolTransport,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One remote tool server and its cached catalog.
pub struct ServerConnection {
    name: String,
    endpoint: String,
    transport: Arc<dyn ToolTransport>,
    state: ConnectionState,
    session: Option<Box<dyn RemoteSession>>,
    tools: Vec<ToolDescriptor>,
    server_info: Option<ServerInfo>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ServerConnection {
    /// Register a server. The connection starts `Disconnected`.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        transport: Arc<dyn ToolTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            transport,
            state: ConnectionState::Disconnected,
            session: None,
            tools: Vec::new(),
            server_info: None,
            event_handler: None,
        }
    }

    /// Attach an event handler for connection lifecycle events.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Handshake details reported by the server on the last successful connect.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    async fn emit(&self, event: ConnectionEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_connection_event(&event).await;
        }
    }

    /// Open the transport, perform the handshake, and cache the tool catalog.
    ///
    /// A no-op when already connected. On failure every partially-acquired resource is
    /// released and the connection is left `Disconnected`.
    pub async fn connect(&mut self) -> Result<(), ToolError> {
        if self.is_connected() {
            return Ok(());
        }
        log::info!("Connecting to MCP server {}: {}", self.name, self.endpoint);
        self.state = ConnectionState::Connecting;

        let mut session = match self.transport.open(&self.endpoint).await {
            Ok(session) => session,
            Err(e) => return self.fail_connect(e).await,
        };

        match Self::establish(session.as_mut(), &self.name).await {
            Ok((info, tools)) => {
                let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
                log::info!("Available tools for {}: {}", self.name, names.join(", "));
                let tool_count = tools.len();
                self.session = Some(session);
                self.tools = tools;
                self.server_info = Some(info);
                self.state = ConnectionState::Connected;
                self.emit(ConnectionEvent::Connected {
                    server_name: self.name.clone(),
                    tool_count,
                })
                .await;
                Ok(())
            }
            Err(e) => {
                release(&self.name, session).await;
                self.fail_connect(e).await
            }
        }
    }

    async fn establish(
        session: &mut dyn RemoteSession,
        name: &str,
    ) -> Result<(ServerInfo, Vec<ToolDescriptor>), BoxError> {
        log::info!("Initializing session for {}...", name);
        let info = session.initialize().await?;
        log::info!("Session for {} initialized successfully", name);
        let tools = session.list_remote_tools().await?;
        Ok((info, tools))
    }

    async fn fail_connect(&mut self, error: BoxError) -> Result<(), ToolError> {
        log::error!("Failed to connect to {}: {}", self.name, error);
        self.state = ConnectionState::Disconnected;
        self.emit(ConnectionEvent::ConnectFailed {
            server_name: self.name.clone(),
            error: error.to_string(),
        })
        .await;
        Err(ToolError::ProtocolError(format!(
            "failed to connect to {}: {}",
            self.name, error
        )))
    }

    /// Release the session and the transport. Safe on a connection that never connected.
    pub async fn disconnect(&mut self) {
        let was_live = self.session.is_some();
        if let Some(session) = self.session.take() {
            log::info!("Disconnecting from {}", self.name);
            release(&self.name, session).await;
        }
        self.state = ConnectionState::Disconnected;
        self.tools.clear();
        if was_live {
            self.emit(ConnectionEvent::Disconnected {
                server_name: self.name.clone(),
            })
            .await;
        }
    }

    /// The cached tool catalog.
    pub fn list_tools(&self) -> Result<&[ToolDescriptor], ToolError> {
        if !self.is_connected() {
            return Err(ToolError::NotConnected(self.name.clone()));
        }
        Ok(&self.tools)
    }

    /// Forward a tool call and normalize the result into a single string payload.
    ///
    /// A failure of the channel itself counts as a runtime failure: the connection is torn
    /// down before the error is returned.
    pub async fn invoke_tool(
        &mut self,
        tool_name: &str,
        arguments: JsonValue,
    ) -> Result<String, ToolError> {
        let session = match (&self.session, self.state) {
            (Some(session), ConnectionState::Connected) => session,
            _ => return Err(ToolError::NotConnected(self.name.clone())),
        };

        log::debug!("Calling tool on {}: {}", self.name, tool_name);
        match session.invoke(tool_name, arguments).await {
            Ok(raw) => raw.normalize(),
            Err(e) => {
                log::error!(
                    "Transport failure while calling {}.{}: {}",
                    self.name,
                    tool_name,
                    e
                );
                self.disconnect().await;
                Err(ToolError::RemoteToolError(format!(
                    "connection to {} failed: {}",
                    self.name, e
                )))
            }
        }
    }
}

/// Release the session then the transport; a failure in the first step does not skip the
/// second.
async fn release(name: &str, mut session: Box<dyn RemoteSession>) {
    if let Err(e) = session.end_session().await {
        log::warn!("Error ending session for {}: {}", name, e);
    }
    if let Err(e) = session.close_transport().await {
        log::warn!("Error closing transport for {}: {}", name, e);
    }
}
