//! Tool Transport Implementations
//!
//! Concrete implementations of [`ToolTransport`] / [`RemoteSession`]:
//!
//! - **McpHttpTransport**: MCP JSON-RPC 2.0 over HTTP, for independently-running tool servers
//! - **LocalToolTransport**: Rust closures (sync and async) served in-process as if they were
//!   a remote server
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolrelay::server_connection::ServerConnection;
//! use toolrelay::tool_protocols::McpHttpTransport;
//!
//! # async {
//! let mut connection = ServerConnection::new(
//!     "postgres",
//!     "http://localhost:8080/mcp",
//!     Arc::new(McpHttpTransport::new()),
//! );
//! connection.connect().await;
//! # };
//! ```

use crate::toolrelay::http_client_pool::get_or_create_client;
use crate::toolrelay::tool_protocol::{
    BoxError, RawContent, RawToolResult, RemoteSession, ServerInfo, ToolDescriptor, ToolError,
    ToolTransport,
};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// MCP protocol revision announced during the handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Type alias for synchronous tool functions exposed via the local transport.
pub type ToolFunction = Arc<dyn Fn(JsonValue) -> Result<RawToolResult, BoxError> + Send + Sync>;

/// Type alias for asynchronous tool functions exposed via the local transport.
pub type AsyncToolFunction = Arc<
    dyn Fn(JsonValue) -> Pin<Box<dyn Future<Output = Result<RawToolResult, BoxError>> + Send>>
        + Send
        + Sync,
>;

/// Wrap a synchronous closure as a [`ToolFunction`].
pub fn tool_fn<F>(function: F) -> ToolFunction
where
    F: Fn(JsonValue) -> Result<RawToolResult, BoxError> + Send + Sync + 'static,
{
    Arc::new(function)
}

/// Wrap an async closure as an [`AsyncToolFunction`].
pub fn async_tool_fn<F, Fut>(function: F) -> AsyncToolFunction
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RawToolResult, BoxError>> + Send + 'static,
{
    Arc::new(
        move |args: JsonValue| -> Pin<Box<dyn Future<Output = Result<RawToolResult, BoxError>> + Send>> {
            Box::pin(function(args))
        },
    )
}

/// MCP (Model Context Protocol) client over HTTP.
///
/// Each [`open`](ToolTransport::open) yields an independent session, so two connections to
/// the same server never share a `Mcp-Session-Id`.
pub struct McpHttpTransport {
    timeout: Duration,
}

impl McpHttpTransport {
    /// Create a transport with a 30 second request timeout.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }

    /// Override the default request timeout for subsequent sessions.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }
}

impl Default for McpHttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a configured server URL into the MCP endpoint.
///
/// A legacy `/sse` endpoint is rewritten to the `/mcp` endpoint on the same base URL.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    match trimmed.strip_suffix("/sse") {
        Some(base) => format!("{}/mcp", base),
        None => trimmed.to_string(),
    }
}

#[async_trait]
impl ToolTransport for McpHttpTransport {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn RemoteSession>, BoxError> {
        let endpoint = normalize_endpoint(endpoint);
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Box::new(ToolError::ProtocolError(format!(
                "unsupported endpoint scheme: {}",
                endpoint
            ))));
        }
        log::debug!("Using MCP endpoint: {}", endpoint);
        Ok(Box::new(McpHttpSession {
            client: Some(get_or_create_client(&endpoint, self.timeout)),
            endpoint,
            session_id: None,
            next_id: AtomicI64::new(1),
        }))
    }

    fn transport_name(&self) -> &str {
        "mcp-http"
    }
}

/// Outcome of one JSON-RPC request.
enum RpcReply {
    Result(JsonValue),
    Error { code: i64, message: String },
}

/// One MCP session over HTTP.
struct McpHttpSession {
    endpoint: String,
    client: Option<reqwest::Client>,
    session_id: Option<String>,
    next_id: AtomicI64,
}

impl McpHttpSession {
    fn client(&self) -> Result<&reqwest::Client, BoxError> {
        self.client.as_ref().ok_or_else(|| {
            Box::new(ToolError::ProtocolError("transport closed".to_string())) as BoxError
        })
    }

    fn post(&self, body: &JsonValue) -> Result<reqwest::RequestBuilder, BoxError> {
        let mut request = self
            .client()?
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        Ok(request)
    }

    /// Send a request and return the matching reply plus any session id the server assigned.
    async fn request(
        &self,
        method: &str,
        params: JsonValue,
    ) -> Result<(RpcReply, Option<String>), BoxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.post(&body)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Box::new(ToolError::ProtocolError(format!(
                "MCP server returned status {} for {}: {}",
                status, method, text
            ))));
        }

        let assigned_session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let text = response.text().await?;

        let messages = if is_event_stream {
            parse_event_stream(&text)?
        } else {
            match serde_json::from_str::<JsonValue>(&text)? {
                JsonValue::Array(items) => items,
                other => vec![other],
            }
        };

        let reply = messages
            .into_iter()
            .find(|m| m.get("id").and_then(JsonValue::as_i64) == Some(id))
            .ok_or_else(|| {
                Box::new(ToolError::ProtocolError(format!(
                    "missing response for request id {}",
                    id
                ))) as BoxError
            })?;

        Ok((decode_reply(reply), assigned_session))
    }

    async fn notify(&self, method: &str) -> Result<(), BoxError> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        let response = self.post(&body)?.send().await?;
        if !response.status().is_success() {
            return Err(Box::new(ToolError::ProtocolError(format!(
                "MCP server rejected {} with status {}",
                method,
                response.status()
            ))));
        }
        Ok(())
    }
}

fn decode_reply(message: JsonValue) -> RpcReply {
    if let Some(error) = message.get("error") {
        return RpcReply::Error {
            code: error.get("code").and_then(JsonValue::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        };
    }
    RpcReply::Result(message.get("result").cloned().unwrap_or(JsonValue::Null))
}

/// Extract the JSON payloads of every `data:` event in a `text/event-stream` body.
fn parse_event_stream(body: &str) -> Result<Vec<JsonValue>, BoxError> {
    let mut messages = Vec::new();
    let mut data = String::new();
    for line in body.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !data.is_empty() {
                messages.push(serde_json::from_str(&data)?);
                data.clear();
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    Ok(messages)
}

fn expect_result(method: &str, reply: RpcReply) -> Result<JsonValue, BoxError> {
    match reply {
        RpcReply::Result(value) => Ok(value),
        RpcReply::Error { code, message } => Err(Box::new(ToolError::ProtocolError(format!(
            "{} failed ({}): {}",
            method, code, message
        )))),
    }
}

#[async_trait]
impl RemoteSession for McpHttpSession {
    async fn initialize(&mut self) -> Result<ServerInfo, BoxError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "toolrelay", "version": env!("CARGO_PKG_VERSION")},
        });
        let (reply, assigned_session) = self.request("initialize", params).await?;
        let result = expect_result("initialize", reply)?;
        if assigned_session.is_some() {
            self.session_id = assigned_session;
        }
        self.notify("notifications/initialized").await?;

        Ok(ServerInfo {
            name: result["serverInfo"]["name"].as_str().map(str::to_string),
            version: result["serverInfo"]["version"].as_str().map(str::to_string),
            protocol_version: result["protocolVersion"].as_str().map(str::to_string),
        })
    }

    async fn list_remote_tools(&self) -> Result<Vec<ToolDescriptor>, BoxError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let (reply, _) = self.request("tools/list", params).await?;
            let result = expect_result("tools/list", reply)?;
            let page: Vec<ToolDescriptor> =
                serde_json::from_value(result.get("tools").cloned().unwrap_or(json!([])))?;
            tools.extend(page);
            cursor = result
                .get("nextCursor")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: JsonValue,
    ) -> Result<RawToolResult, BoxError> {
        let params = json!({"name": tool_name, "arguments": arguments});
        let (reply, _) = self.request("tools/call", params).await?;
        match reply {
            RpcReply::Result(value) => Ok(serde_json::from_value(value)?),
            RpcReply::Error { code, message } => Ok(RawToolResult {
                content: vec![RawContent::Text {
                    text: format!("{} ({})", message, code),
                }],
                structured_content: None,
                is_error: true,
            }),
        }
    }

    async fn end_session(&mut self) -> Result<(), BoxError> {
        let session_id = match self.session_id.take() {
            Some(session_id) => session_id,
            None => return Ok(()),
        };
        let response = self
            .client()?
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session_id)
            .send()
            .await?;
        let status = response.status();
        // servers that do not support explicit termination answer 405
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            Err(Box::new(ToolError::ProtocolError(format!(
                "session termination returned status {}",
                status
            ))))
        }
    }

    async fn close_transport(&mut self) -> Result<(), BoxError> {
        self.client = None;
        Ok(())
    }
}

enum LocalTool {
    Sync(ToolFunction),
    Async(AsyncToolFunction),
}

impl Clone for LocalTool {
    fn clone(&self) -> Self {
        match self {
            LocalTool::Sync(f) => LocalTool::Sync(f.clone()),
            LocalTool::Async(f) => LocalTool::Async(f.clone()),
        }
    }
}

type LocalRegistry = Arc<RwLock<BTreeMap<String, (ToolDescriptor, LocalTool)>>>;

/// In-process tool server backed by Rust functions.
///
/// An `Err` returned by a registered function is reported as a tool-level failure, just like
/// a remote server flagging `isError`.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use toolrelay::tool_protocol::{RawToolResult, ToolDescriptor};
/// use toolrelay::tool_protocols::{tool_fn, LocalToolTransport};
///
/// # async {
/// let transport = LocalToolTransport::new();
/// transport
///     .register_tool(
///         ToolDescriptor::new(
///             "add",
///             "Adds two numbers",
///             json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}),
///         ),
///         tool_fn(|args| {
///             let a = args["a"].as_f64().unwrap_or(0.0);
///             let b = args["b"].as_f64().unwrap_or(0.0);
///             Ok(RawToolResult::text((a + b).to_string()))
///         }),
///     )
///     .await;
/// # };
/// ```
pub struct LocalToolTransport {
    tools: LocalRegistry,
    live_sessions: Arc<AtomicUsize>,
}

impl LocalToolTransport {
    /// Create an empty transport ready to accept tool registrations.
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(BTreeMap::new())),
            live_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a synchronous tool function, replacing any tool with the same name.
    pub async fn register_tool(&self, descriptor: ToolDescriptor, function: ToolFunction) {
        let name = descriptor.name.clone();
        self.tools
            .write()
            .await
            .insert(name, (descriptor, LocalTool::Sync(function)));
    }

    /// Register an asynchronous tool function.
    pub async fn register_async_tool(&self, descriptor: ToolDescriptor, function: AsyncToolFunction) {
        let name = descriptor.name.clone();
        self.tools
            .write()
            .await
            .insert(name, (descriptor, LocalTool::Async(function)));
    }

    /// Remove a tool.
    pub async fn unregister_tool(&self, name: &str) {
        self.tools.write().await.remove(name);
    }

    /// Number of sessions that completed the handshake and have not ended yet.
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }
}

impl Default for LocalToolTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolTransport for LocalToolTransport {
    async fn open(&self, _endpoint: &str) -> Result<Box<dyn RemoteSession>, BoxError> {
        Ok(Box::new(LocalSession {
            tools: self.tools.clone(),
            live_sessions: self.live_sessions.clone(),
            initialized: false,
        }))
    }

    fn transport_name(&self) -> &str {
        "local"
    }
}

struct LocalSession {
    tools: LocalRegistry,
    live_sessions: Arc<AtomicUsize>,
    initialized: bool,
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn initialize(&mut self) -> Result<ServerInfo, BoxError> {
        if !self.initialized {
            self.initialized = true;
            self.live_sessions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(ServerInfo {
            name: Some("local".to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            protocol_version: Some(MCP_PROTOCOL_VERSION.to_string()),
        })
    }

    async fn list_remote_tools(&self) -> Result<Vec<ToolDescriptor>, BoxError> {
        let tools = self.tools.read().await;
        Ok(tools.values().map(|(d, _)| d.clone()).collect())
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: JsonValue,
    ) -> Result<RawToolResult, BoxError> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(tool_name).map(|(_, tool)| tool.clone())
        };
        let outcome = match tool {
            Some(LocalTool::Sync(f)) => f(arguments),
            Some(LocalTool::Async(f)) => f(arguments).await,
            None => Err(Box::new(ToolError::UnknownTool(tool_name.to_string())) as BoxError),
        };
        Ok(outcome.unwrap_or_else(|e| RawToolResult {
            is_error: true,
            ..RawToolResult::text(e.to_string())
        }))
    }

    async fn end_session(&mut self) -> Result<(), BoxError> {
        if self.initialized {
            self.initialized = false;
            self.live_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_normalize_endpoint_rewrites_legacy_sse() {
        assert_eq!(
            normalize_endpoint("http://localhost:8000/sse"),
            "http://localhost:8000/mcp"
        );
        assert_eq!(
            normalize_endpoint("http://localhost:8000/mcp/"),
            "http://localhost:8000/mcp"
        );
    }

    #[test]
    fn test_parse_event_stream() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n";
        let messages = parse_event_stream(body).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], 1);
    }

    #[test]
    fn test_decode_reply_error() {
        let reply = decode_reply(json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32602, "message": "bad args"}}));
        match reply {
            RpcReply::Error { code, message } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad args");
            }
            RpcReply::Result(_) => panic!("expected error"),
        }
    }

    struct RecordedRequest {
        http_method: String,
        session_id: Option<String>,
        body: JsonValue,
    }

    type RequestLog = Arc<std::sync::Mutex<Vec<RecordedRequest>>>;

    async fn read_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let http_method = lines
            .next()
            .and_then(|line| line.split(' ').next())
            .unwrap_or_default()
            .to_string();
        let mut content_length = 0;
        let mut session_id = None;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "content-length" => content_length = value.trim().parse().unwrap_or(0),
                    "mcp-session-id" => session_id = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }

        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let end = buf.len().min(header_end + content_length);
        let body = serde_json::from_slice(&buf[header_end..end]).unwrap_or(JsonValue::Null);
        Ok(RecordedRequest {
            http_method,
            session_id,
            body,
        })
    }

    fn http_response(status: &str, content_type: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status,
            content_type,
            body.len(),
            extra_headers,
            body
        )
    }

    /// Canned MCP server: assigns `sess-42`, pages the catalog over SSE then JSON, and
    /// fails calls to `broken` with a JSON-RPC error.
    fn canned_reply(request: &RecordedRequest, delete_status: &str) -> String {
        if request.http_method == "DELETE" {
            return http_response(delete_status, "text/plain", "", "");
        }
        let id = request.body["id"].clone();
        match request.body["method"].as_str().unwrap_or_default() {
            "initialize" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": MCP_PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "pg", "version": "1.0"}
                    }
                });
                http_response(
                    "200 OK",
                    "application/json",
                    "Mcp-Session-Id: sess-42\r\n",
                    &body.to_string(),
                )
            }
            "notifications/initialized" => http_response("202 Accepted", "text/plain", "", ""),
            "tools/list" if request.body["params"]["cursor"] == "page-2" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [
                        {"name": "describe", "description": "Describe a table", "inputSchema": {"type": "object"}}
                    ]}
                });
                http_response("200 OK", "application/json", "", &body.to_string())
            }
            "tools/list" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "tools": [{"name": "query", "description": "Run SQL", "inputSchema": {"type": "object"}}],
                        "nextCursor": "page-2"
                    }
                });
                let stream = format!("event: message\ndata: {}\n\n", body);
                http_response("200 OK", "text/event-stream", "", &stream)
            }
            "tools/call" if request.body["params"]["name"] == "broken" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "bad arguments"}
                });
                http_response("200 OK", "application/json", "", &body.to_string())
            }
            "tools/call" => {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [{"type": "text", "text": "3 rows"}], "isError": false}
                });
                http_response("200 OK", "application/json", "", &body.to_string())
            }
            other => http_response("404 Not Found", "text/plain", "", other),
        }
    }

    /// Serve one request per connection on an ephemeral port; returns the `/mcp` endpoint.
    async fn spawn_mcp_server(delete_status: &'static str) -> (String, RequestLog) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let log: RequestLog = Arc::default();
        let recorded = log.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if let Ok(request) = read_request(&mut stream).await {
                    let response = canned_reply(&request, delete_status);
                    recorded.lock().unwrap().push(request);
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            }
        });
        (format!("http://{}/mcp", address), log)
    }

    #[tokio::test]
    async fn test_mcp_http_session_lifecycle() {
        let (endpoint, log) = spawn_mcp_server("405 Method Not Allowed").await;
        let transport = McpHttpTransport::new().with_timeout(5);
        let mut session = transport.open(&endpoint).await.unwrap();

        let info = session.initialize().await.unwrap();
        assert_eq!(info.name.as_deref(), Some("pg"));
        assert_eq!(info.protocol_version.as_deref(), Some(MCP_PROTOCOL_VERSION));

        let names: Vec<String> = session
            .list_remote_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["query", "describe"]);

        let ok = session
            .invoke("query", json!({"sql": "select 1"}))
            .await
            .unwrap();
        assert_eq!(ok.normalize().unwrap(), "3 rows");

        let failed = session.invoke("broken", json!({})).await.unwrap();
        assert!(failed.is_error);
        assert_eq!(
            failed.normalize(),
            Err(ToolError::RemoteToolError("bad arguments (-32602)".to_string()))
        );

        // 405 means the server does not support explicit termination
        session.end_session().await.unwrap();
        session.close_transport().await.unwrap();

        let requests = log.lock().unwrap();
        let sequence: Vec<String> = requests
            .iter()
            .map(|r| match r.body["method"].as_str() {
                Some(method) => method.to_string(),
                None => r.http_method.clone(),
            })
            .collect();
        assert_eq!(
            sequence,
            vec![
                "initialize",
                "notifications/initialized",
                "tools/list",
                "tools/list",
                "tools/call",
                "tools/call",
                "DELETE",
            ]
        );
        assert_eq!(requests[0].session_id, None);
        assert!(requests[1..]
            .iter()
            .all(|r| r.session_id.as_deref() == Some("sess-42")));
        assert_eq!(requests[0].body["params"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert!(requests[1].body.get("id").is_none());
        assert_eq!(requests[2].body["params"], json!({}));
        assert_eq!(requests[3].body["params"]["cursor"], "page-2");
        assert_eq!(requests[4].body["params"]["arguments"]["sql"], "select 1");
    }

    #[tokio::test]
    async fn test_mcp_http_end_session_surfaces_server_error() {
        let (endpoint, log) = spawn_mcp_server("500 Internal Server Error").await;
        let mut session = McpHttpTransport::new().open(&endpoint).await.unwrap();
        session.initialize().await.unwrap();

        assert!(session.end_session().await.is_err());
        // the session id is consumed, so a second end is a no-op
        session.end_session().await.unwrap();
        assert_eq!(
            log.lock()
                .unwrap()
                .iter()
                .filter(|r| r.http_method == "DELETE")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_open_rejects_non_http_endpoint() {
        let transport = McpHttpTransport::new();
        assert!(transport.open("ftp://example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_local_transport_round_trip() {
        let transport = LocalToolTransport::new();
        transport
            .register_tool(
                ToolDescriptor::new("echo", "Echo input", json!({"type": "object", "properties": {}})),
                tool_fn(|args| Ok(RawToolResult::text(args["msg"].as_str().unwrap_or("")))),
            )
            .await;
        transport
            .register_async_tool(
                ToolDescriptor::new("fail", "Always fails", json!({"type": "object", "properties": {}})),
                async_tool_fn(|_| async { Err::<RawToolResult, BoxError>("nope".into()) }),
            )
            .await;

        let mut session = transport.open("local://").await.unwrap();
        session.initialize().await.unwrap();
        assert_eq!(transport.live_sessions(), 1);

        let names: Vec<String> = session
            .list_remote_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["echo", "fail"]);

        let ok = session.invoke("echo", json!({"msg": "hi"})).await.unwrap();
        assert_eq!(ok.normalize().unwrap(), "hi");

        let failed = session.invoke("fail", json!({})).await.unwrap();
        assert!(failed.is_error);

        let missing = session.invoke("missing", json!({})).await.unwrap();
        assert!(missing.is_error);

        session.end_session().await.unwrap();
        assert_eq!(transport.live_sessions(), 0);
    }
}
