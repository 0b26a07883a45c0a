use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolrelay::client_wrapper::{
    InferenceBackend, InferenceRequest, InferenceResponse, LlmGateway, StopCondition,
};
use toolrelay::clients::anthropic::encode_request;
use toolrelay::config::{ConfigProvider, McpJsonConfig, RelayConfig, TransportOptions};
use toolrelay::message::ContentPart;
use toolrelay::orchestration::OrchestrationError;
use toolrelay::session_manager::SessionManager;
use toolrelay::tool_protocol::{
    BoxError, RawToolResult, RemoteSession, ToolDescriptor, ToolTransport,
};
use toolrelay::tool_protocols::{async_tool_fn, tool_fn, LocalToolTransport};

/// Answers every query by echoing its last user text, optionally after a delay.
struct EchoBackend {
    delay: Option<Duration>,
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    fn model_name(&self) -> &str {
        "mock-echo"
    }

    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, BoxError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let last = request
            .messages
            .last()
            .map(|m| m.text())
            .unwrap_or_default();
        Ok(InferenceResponse::new(
            StopCondition::EndTurn,
            vec![ContentPart::text(format!("echo: {}", last))],
        ))
    }
}

/// Asks for the slow tool on the first call, then answers by echoing. Records every request.
struct SlowToolBackend {
    requests: Mutex<Vec<InferenceRequest>>,
}

#[async_trait]
impl InferenceBackend for SlowToolBackend {
    fn model_name(&self) -> &str {
        "mock-slow"
    }

    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, BoxError> {
        let last = request.messages.last().map(|m| m.text()).unwrap_or_default();
        let first = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len() == 1
        };
        if first {
            return Ok(InferenceResponse::new(
                StopCondition::ToolUse,
                vec![
                    ContentPart::text("checking"),
                    ContentPart::ToolRequest {
                        id: "slow1".to_string(),
                        tool_name: "local__slow".to_string(),
                        arguments: json!({}),
                    },
                ],
            ));
        }
        Ok(InferenceResponse::new(
            StopCondition::EndTurn,
            vec![ContentPart::text(format!("echo: {}", last))],
        ))
    }
}

/// A transport whose servers are never reachable.
struct DownTransport;

#[async_trait]
impl ToolTransport for DownTransport {
    async fn open(&self, endpoint: &str) -> Result<Box<dyn RemoteSession>, BoxError> {
        Err(format!("connection refused: {}", endpoint).into())
    }

    fn transport_name(&self) -> &str {
        "down"
    }
}

async fn local_tools() -> Arc<LocalToolTransport> {
    let tools = LocalToolTransport::new();
    tools
        .register_tool(
            ToolDescriptor::new(
                "ping",
                "Replies pong",
                json!({"type": "object", "properties": {}}),
            ),
            tool_fn(|_args| Ok(RawToolResult::text("pong"))),
        )
        .await;
    Arc::new(tools)
}

fn manager(transport: Arc<dyn ToolTransport>, config: RelayConfig) -> SessionManager {
    let gateway = LlmGateway::new(Arc::new(EchoBackend { delay: None }));
    SessionManager::new(gateway, config).with_transport(transport)
}

#[tokio::test]
async fn test_session_lifecycle() {
    let tools = local_tools().await;
    let manager = manager(tools.clone(), RelayConfig::default());

    let id = manager
        .create_session(vec![("alpha", "local://a"), ("beta", "local://b")])
        .await
        .unwrap();
    assert_eq!(manager.session_ids(), vec![id.clone()]);
    assert_eq!(tools.live_sessions(), 2);

    let catalog: Vec<String> = manager
        .list_catalog(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(catalog, vec!["alpha__ping".to_string(), "beta__ping".to_string()]);

    let answer = manager.submit_query(&id, "hello").await.unwrap();
    assert_eq!(answer, "echo: hello");
    let history = manager.history(&id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].query, "hello");

    manager.teardown_session(&id).await.unwrap();
    assert_eq!(tools.live_sessions(), 0);
    assert_eq!(manager.session_count(), 0);
    assert_eq!(
        manager.submit_query(&id, "again").await,
        Err(OrchestrationError::SessionNotFound(id.clone()))
    );
    assert!(manager.teardown_session(&id).await.is_err());
}

#[tokio::test]
async fn test_no_reachable_server_fails_creation() {
    let manager = manager(Arc::new(DownTransport), RelayConfig::default());
    assert_eq!(
        manager.create_session(vec![("pg", "http://localhost:1/mcp")]).await,
        Err(OrchestrationError::NoServersConnected)
    );
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn test_query_timeout() {
    let gateway = LlmGateway::new(Arc::new(EchoBackend {
        delay: Some(Duration::from_secs(30)),
    }));
    let config = RelayConfig::default().with_session_timeout(Some(Duration::from_millis(50)));
    let manager = SessionManager::new(gateway, config).with_transport(local_tools().await);

    let id = manager.create_session(vec![("local", "local://")]).await.unwrap();
    assert_eq!(
        manager.submit_query(&id, "slow").await,
        Err(OrchestrationError::Timeout(Duration::from_millis(50)))
    );
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let manager = Arc::new(manager(local_tools().await, RelayConfig::default()));
    let first = manager.create_session(vec![("local", "local://")]).await.unwrap();
    let second = manager.create_session(vec![("local", "local://")]).await.unwrap();
    assert_ne!(first, second);

    let (a, b) = tokio::join!(
        manager.submit_query(&first, "one"),
        manager.submit_query(&second, "two")
    );
    assert_eq!(a.unwrap(), "echo: one");
    assert_eq!(b.unwrap(), "echo: two");

    manager.clear_history(&first).await.unwrap();
    assert!(manager.history(&first).await.unwrap().is_empty());
    assert_eq!(manager.history(&second).await.unwrap().len(), 1);

    manager.teardown_all().await;
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn test_server_management() {
    let tools = local_tools().await;
    let manager = manager(tools.clone(), RelayConfig::default());
    let id = manager.create_session(vec![("alpha", "local://a")]).await.unwrap();

    manager.add_server(&id, "beta", "local://b").await.unwrap();
    let status = manager.server_status(&id).await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.connected && s.tool_count == 1));
    assert_eq!(status[1].endpoint, "local://b");

    let raw = manager.list_server_tools(&id, "beta").await.unwrap();
    assert_eq!(raw[0].name, "ping");

    assert_eq!(
        manager.connect_server(&id, "gamma").await,
        Err(OrchestrationError::ServerNotFound("gamma".to_string()))
    );
    manager.connect_server(&id, "alpha").await.unwrap();
    assert_eq!(tools.live_sessions(), 2);
    assert_eq!(manager.summary(&id).await.unwrap(), None);
}

#[tokio::test]
async fn test_create_session_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let provider = McpJsonConfig::new(dir.path().join("mcp.json"));
    assert!(provider.persist_server("alpha", "https://a.example/mcp", &TransportOptions::default()));
    assert!(provider.persist_server("beta", "https://b.example/mcp", &TransportOptions::default()));

    let tools = local_tools().await;
    let manager = manager(tools.clone(), RelayConfig::default());

    let only_beta = manager
        .create_session_from_config(&provider, &["beta", "missing"])
        .await
        .unwrap();
    let status = manager.server_status(&only_beta).await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "beta");
    assert_eq!(status[0].endpoint, "https://b.example/mcp");

    let everything = manager.create_session_from_config(&provider, &[]).await.unwrap();
    assert_eq!(manager.server_status(&everything).await.unwrap().len(), 2);

    assert_eq!(
        manager
            .create_session_from_config(&provider, &["missing"])
            .await,
        Err(OrchestrationError::NoServersConnected)
    );
}

#[tokio::test]
async fn test_timeout_mid_batch_keeps_next_query_paired() {
    let tools = LocalToolTransport::new();
    tools
        .register_async_tool(
            ToolDescriptor::new("slow", "Takes its time", json!({"type": "object", "properties": {}})),
            async_tool_fn(|_args| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BoxError>(RawToolResult::text("late"))
            }),
        )
        .await;

    let backend = Arc::new(SlowToolBackend {
        requests: Mutex::new(Vec::new()),
    });
    let config = RelayConfig::default()
        .with_session_timeout(Some(Duration::from_millis(100)))
        .with_summary_interval(0);
    let manager = SessionManager::new(LlmGateway::new(backend.clone()), config)
        .with_transport(Arc::new(tools));
    let id = manager.create_session(vec![("local", "local://")]).await.unwrap();

    assert_eq!(
        manager.submit_query(&id, "q1").await,
        Err(OrchestrationError::Timeout(Duration::from_millis(100)))
    );
    assert_eq!(manager.submit_query(&id, "q2").await.unwrap(), "echo: q2");

    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let body = encode_request("mock-slow", &requests[1]);
    let mut sent = HashSet::new();
    let mut answered = HashSet::new();
    for message in body["messages"].as_array().unwrap() {
        for block in message["content"].as_array().unwrap() {
            match block["type"].as_str() {
                Some("tool_use") => {
                    sent.insert(block["id"].as_str().unwrap().to_string());
                }
                Some("tool_result") => {
                    answered.insert(block["tool_use_id"].as_str().unwrap().to_string());
                }
                _ => {}
            }
        }
    }
    assert!(sent.is_empty(), "unanswered tool_use resubmitted: {:?}", sent);
    assert!(answered.is_empty());
    assert!(requests[1]
        .messages
        .iter()
        .all(|m| m.tool_request_ids().count() == 0));
}
