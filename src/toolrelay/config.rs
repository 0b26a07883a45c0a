//! Configuration for toolrelay.
//!
//! [`RelayConfig`] carries the tunables of an orchestration session. Users construct it
//! however they want; every field has a default and a `with_*` builder method.
//!
//! Server registrations come from a [`ConfigProvider`]. [`McpJsonConfig`] reads and writes the
//! common `mcp.json` layout used by desktop MCP clients:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "postgres": {
//!       "command": "npx",
//!       "args": ["mcp-remote", "http://localhost:8000/sse", "--transport", "sse-only", "--allow-http"]
//!     }
//!   }
//! }
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use toolrelay::config::RelayConfig;
//!
//! let config = RelayConfig::default()
//!     .with_max_turns(5)
//!     .with_session_timeout(None);
//! assert_eq!(config.memory_capacity, 20);
//! assert_eq!(config.rate_window, Duration::from_secs(60));
//! ```

use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for an orchestration session.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Messages kept in conversation memory.
    pub memory_capacity: usize,
    /// Tool invocations admitted per `rate_window`.
    pub rate_limit: usize,
    pub rate_window: Duration,
    /// Added to every rate limiter wait.
    pub rate_safety_margin: Duration,
    /// Gateway round-trips allowed per query.
    pub max_turns: usize,
    /// Refresh the summary whenever the memory length is a multiple of this.
    pub summary_interval: usize,
    /// Pause after a tool batch for throttle-sensitive model families.
    pub throttle_delay: Duration,
    /// Upper bound on one `submit_query`; `None` disables it.
    pub session_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 20,
            rate_limit: 10,
            rate_window: Duration::from_secs(60),
            rate_safety_margin: Duration::from_secs(1),
            max_turns: 10,
            summary_interval: 5,
            throttle_delay: Duration::from_secs(1),
            session_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl RelayConfig {
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_rate_limit(mut self, calls: usize, window: Duration) -> Self {
        self.rate_limit = calls;
        self.rate_window = window;
        self
    }

    pub fn with_rate_safety_margin(mut self, margin: Duration) -> Self {
        self.rate_safety_margin = margin;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_summary_interval(mut self, interval: usize) -> Self {
        self.summary_interval = interval;
        self
    }

    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// How a persisted server should be reached.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Launcher command written next to the args.
    pub command: String,
    /// Transport name passed to the launcher.
    pub transport: String,
    /// Permit plain `http://` endpoints.
    pub allow_http: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            transport: "sse-only".to_string(),
            allow_http: false,
        }
    }
}

/// Source of server registrations.
pub trait ConfigProvider: Send + Sync {
    /// Every configured server, by name.
    fn list_configured_servers(&self) -> BTreeMap<String, String>;

    /// Add or replace one server. Returns `false` when it could not be stored.
    fn persist_server(&self, name: &str, endpoint: &str, options: &TransportOptions) -> bool;
}

/// `mcp.json` file provider.
#[derive(Debug, Clone)]
pub struct McpJsonConfig {
    path: PathBuf,
}

impl McpJsonConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<JsonValue, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_server(
        &self,
        name: &str,
        endpoint: &str,
        options: &TransportOptions,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut config = if self.path.exists() {
            self.read()?
        } else {
            json!({"mcpServers": {}})
        };
        let root = config
            .as_object_mut()
            .ok_or("config root is not an object")?;
        let servers = root
            .entry("mcpServers")
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if !servers.is_object() {
            *servers = JsonValue::Object(Map::new());
        }

        let mut args = vec![
            "mcp-remote".to_string(),
            endpoint.to_string(),
            "--transport".to_string(),
            options.transport.clone(),
        ];
        if options.allow_http || endpoint.starts_with("http://") {
            args.push("--allow-http".to_string());
        }
        servers[name] = json!({"command": options.command, "args": args});

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }
}

impl ConfigProvider for McpJsonConfig {
    fn list_configured_servers(&self) -> BTreeMap<String, String> {
        let mut servers = BTreeMap::new();
        if !self.path.exists() {
            log::warn!("MCP config file not found at {}", self.path.display());
            return servers;
        }
        let config = match self.read() {
            Ok(config) => config,
            Err(e) => {
                log::error!("Error loading MCP config: {}", e);
                return servers;
            }
        };
        let entries = match config.get("mcpServers").and_then(JsonValue::as_object) {
            Some(entries) => entries,
            None => {
                log::warn!("No MCP servers found in config");
                return servers;
            }
        };
        for (name, entry) in entries {
            match entry["args"].get(1).and_then(JsonValue::as_str) {
                Some(url) => {
                    log::info!("Found server {} with URL: {}", name, url);
                    servers.insert(name.clone(), url.to_string());
                }
                None => log::warn!("Could not find URL for server {} in MCP config", name),
            }
        }
        servers
    }

    fn persist_server(&self, name: &str, endpoint: &str, options: &TransportOptions) -> bool {
        match self.write_server(name, endpoint, options) {
            Ok(()) => {
                log::info!("Added/updated server {} with URL: {}", name, endpoint);
                true
            }
            Err(e) => {
                log::error!("Error saving server to MCP config: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let provider = McpJsonConfig::new(dir.path().join("mcp.json"));
        assert!(provider.list_configured_servers().is_empty());
    }

    #[test]
    fn test_persist_then_list() {
        let dir = tempdir().unwrap();
        let provider = McpJsonConfig::new(dir.path().join("nested").join("mcp.json"));
        assert!(provider.persist_server(
            "pg",
            "http://localhost:8000/sse",
            &TransportOptions::default()
        ));
        assert!(provider.persist_server(
            "docs",
            "https://docs.example.com/mcp",
            &TransportOptions {
                transport: "http-only".to_string(),
                ..TransportOptions::default()
            }
        ));

        let servers = provider.list_configured_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers["pg"], "http://localhost:8000/sse");

        let raw: JsonValue =
            serde_json::from_str(&std::fs::read_to_string(provider.path()).unwrap()).unwrap();
        assert_eq!(
            raw["mcpServers"]["pg"]["args"],
            json!(["mcp-remote", "http://localhost:8000/sse", "--transport", "sse-only", "--allow-http"])
        );
        assert_eq!(raw["mcpServers"]["docs"]["args"].as_array().unwrap().len(), 4);
        assert_eq!(raw["mcpServers"]["docs"]["command"], "npx");
    }

    #[test]
    fn test_entries_without_url_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(
            &path,
            r#"{"mcpServers": {"bad": {"command": "npx", "args": ["mcp-remote"]},
                "good": {"command": "npx", "args": ["mcp-remote", "https://a/mcp"]}}}"#,
        )
        .unwrap();
        let servers = McpJsonConfig::new(&path).list_configured_servers();
        assert_eq!(servers.keys().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    fn test_persist_into_corrupt_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "not json").unwrap();
        let provider = McpJsonConfig::new(&path);
        assert!(!provider.persist_server("x", "https://x", &TransportOptions::default()));
        assert!(provider.list_configured_servers().is_empty());
    }
}
