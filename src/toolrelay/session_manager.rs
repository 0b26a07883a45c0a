//! Session registry exposed to front ends.
//!
//! A [`SessionManager`] creates [`OrchestrationSession`]s on demand, keys them by a UUID, and
//! routes every later call to the right one. All sessions share one [`LlmGateway`] and one
//! [`ToolTransport`]; each session still opens its own remote sessions, so server state is
//! never shared across sessions.
//!
//! Calls against different sessions run concurrently; calls against the same session are
//! serialized by its mutex.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolrelay::client_wrapper::LlmGateway;
//! use toolrelay::clients::anthropic::AnthropicClient;
//! use toolrelay::config::RelayConfig;
//! use toolrelay::session_manager::SessionManager;
//!
//! # async {
//! let gateway = LlmGateway::new(Arc::new(AnthropicClient::new_with_model_str("key", "claude-haiku-4-5")));
//! let manager = SessionManager::new(gateway, RelayConfig::default());
//!
//! let id = manager
//!     .create_session(vec![("postgres", "http://localhost:8000/mcp")])
//!     .await
//!     .unwrap();
//! let answer = manager.submit_query(&id, "How many orders shipped today?").await.unwrap();
//! println!("{}", answer);
//! manager.teardown_session(&id).await.unwrap();
//! # };
//! ```

use crate::toolrelay::client_wrapper::LlmGateway;
use crate::toolrelay::config::{ConfigProvider, RelayConfig};
use crate::toolrelay::event::EventHandler;
use crate::toolrelay::orchestration::{Exchange, OrchestrationError, OrchestrationSession};
use crate::toolrelay::rate_limiter::Clock;
use crate::toolrelay::tool_protocol::{ToolDescriptor, ToolTransport};
use crate::toolrelay::tool_protocols::McpHttpTransport;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Connection summary for one server of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub endpoint: String,
    pub connected: bool,
    pub tool_count: usize,
}

type SharedSession = Arc<Mutex<OrchestrationSession>>;

/// Registry of live orchestration sessions.
pub struct SessionManager {
    gateway: LlmGateway,
    config: RelayConfig,
    transport: Arc<dyn ToolTransport>,
    event_handler: Option<Arc<dyn EventHandler>>,
    clock: Option<Arc<dyn Clock>>,
    sessions: DashMap<String, SharedSession>,
}

impl SessionManager {
    /// Sessions created by this manager reach servers over MCP HTTP.
    pub fn new(gateway: LlmGateway, config: RelayConfig) -> Self {
        Self {
            gateway,
            config,
            transport: Arc::new(McpHttpTransport::new()),
            event_handler: None,
            clock: None,
            sessions: DashMap::new(),
        }
    }

    /// Reach servers through `transport` instead.
    pub fn with_transport(mut self, transport: Arc<dyn ToolTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Propagate `handler` to every session and server connection created afterwards.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Rate limiters of new sessions read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn session(&self, session_id: &str) -> Result<SharedSession, OrchestrationError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.to_string()))
    }

    /// Register and connect every `(name, endpoint)` pair in a fresh session.
    ///
    /// Fails with `NoServersConnected` when none of the servers could be reached; nothing
    /// is kept in that case.
    pub async fn create_session<I, N, E>(&self, servers: I) -> Result<String, OrchestrationError>
    where
        I: IntoIterator<Item = (N, E)>,
        N: AsRef<str>,
        E: AsRef<str>,
    {
        let session_id = Uuid::new_v4().to_string();
        let mut session =
            OrchestrationSession::new(session_id.clone(), self.gateway.clone(), self.config.clone());
        if let Some(clock) = &self.clock {
            session = session.with_clock(clock.clone());
        }
        if let Some(handler) = &self.event_handler {
            session = session.with_event_handler(handler.clone());
        }
        for (name, endpoint) in servers {
            session.add_server(name.as_ref(), endpoint.as_ref(), self.transport.clone());
        }

        let connected = session.connect_all().await;
        if connected.is_empty() {
            session.disconnect_all().await;
            log::error!("Failed to connect to any MCP servers");
            return Err(OrchestrationError::NoServersConnected);
        }

        log::info!(
            "Connected servers for session {}: {}",
            session_id,
            connected.join(", ")
        );
        self.sessions
            .insert(session_id.clone(), Arc::new(Mutex::new(session)));
        Ok(session_id)
    }

    /// Create a session from configured servers. An empty `names` selects every
    /// configured server; unknown names are skipped.
    pub async fn create_session_from_config(
        &self,
        provider: &dyn ConfigProvider,
        names: &[&str],
    ) -> Result<String, OrchestrationError> {
        let configured = provider.list_configured_servers();
        let selected: Vec<(String, String)> = if names.is_empty() {
            configured.into_iter().collect()
        } else {
            names
                .iter()
                .filter_map(|name| match configured.get(*name) {
                    Some(endpoint) => Some((name.to_string(), endpoint.clone())),
                    None => {
                        log::warn!("Server {} not found in configuration", name);
                        None
                    }
                })
                .collect()
        };
        if selected.is_empty() {
            log::error!("No servers found in configuration");
            return Err(OrchestrationError::NoServersConnected);
        }
        self.create_session(selected).await
    }

    /// Answer a query in a session, bounded by the configured session timeout.
    pub async fn submit_query(
        &self,
        session_id: &str,
        query: &str,
    ) -> Result<String, OrchestrationError> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        match self.config.session_timeout {
            Some(limit) => tokio::time::timeout(limit, session.submit_query(query))
                .await
                .map_err(|_| {
                    log::error!("Session {} query timed out after {:?}", session_id, limit);
                    OrchestrationError::Timeout(limit)
                })?,
            None => session.submit_query(query).await,
        }
    }

    /// Disconnect every server of a session and forget it.
    pub async fn teardown_session(&self, session_id: &str) -> Result<(), OrchestrationError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.to_string()))?;
        session.lock().await.disconnect_all().await;
        log::info!("Session {} torn down", session_id);
        Ok(())
    }

    /// Tear down every session.
    pub async fn teardown_all(&self) {
        for session_id in self.session_ids() {
            if let Err(e) = self.teardown_session(&session_id).await {
                log::warn!("{}", e);
            }
        }
    }

    /// The LLM-facing tool catalog of a session.
    pub async fn list_catalog(
        &self,
        session_id: &str,
    ) -> Result<Vec<ToolDescriptor>, OrchestrationError> {
        let session = self.session(session_id)?;
        let catalog = session.lock().await.list_catalog();
        Ok(catalog)
    }

    pub async fn server_status(
        &self,
        session_id: &str,
    ) -> Result<Vec<ServerStatus>, OrchestrationError> {
        let session = self.session(session_id)?;
        let session = session.lock().await;
        Ok(session
            .connections()
            .iter()
            .map(|conn| ServerStatus {
                name: conn.name().to_string(),
                endpoint: conn.endpoint().to_string(),
                connected: conn.is_connected(),
                tool_count: conn.list_tools().map(|tools| tools.len()).unwrap_or(0),
            })
            .collect())
    }

    /// Register a server in an existing session and connect it. A server with the same
    /// name is disconnected and replaced.
    pub async fn add_server(
        &self,
        session_id: &str,
        name: &str,
        endpoint: &str,
    ) -> Result<(), OrchestrationError> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        session
            .register_server(name, endpoint, self.transport.clone())
            .await;
        session.connect_server(name).await
    }

    /// Connect, or reconnect, one registered server of a session.
    pub async fn connect_server(
        &self,
        session_id: &str,
        name: &str,
    ) -> Result<(), OrchestrationError> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        session.connect_server(name).await
    }

    /// Raw tool descriptors of one server, connecting it first when needed.
    pub async fn list_server_tools(
        &self,
        session_id: &str,
        name: &str,
    ) -> Result<Vec<ToolDescriptor>, OrchestrationError> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        session.list_server_tools(name).await
    }

    /// Reset the conversation of a session.
    pub async fn clear_history(&self, session_id: &str) -> Result<(), OrchestrationError> {
        let session = self.session(session_id)?;
        session.lock().await.clear_history();
        Ok(())
    }

    pub async fn summary(&self, session_id: &str) -> Result<Option<String>, OrchestrationError> {
        let session = self.session(session_id)?;
        let summary = session.lock().await.summary().map(str::to_string);
        Ok(summary)
    }

    /// Every `(query, response)` exchange of a session, oldest first.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Exchange>, OrchestrationError> {
        let session = self.session(session_id)?;
        let history = session.lock().await.history().to_vec();
        Ok(history)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
