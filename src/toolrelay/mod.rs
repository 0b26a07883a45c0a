// src/toolrelay/mod.rs

pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod event;
pub mod http_client_pool;
pub mod memory;
pub mod message;
pub mod orchestration;
pub mod rate_limiter;
pub mod server_connection;
pub mod session_manager;
pub mod tool_protocol;
pub mod tool_protocols;
pub mod tool_router;

// Export the session types at the module root so callers can write toolrelay::SessionManager
pub use orchestration::OrchestrationSession;
pub use session_manager::SessionManager;
