//! Projects the tools of every connected server into one LLM-facing catalog.
//!
//! Tool names are only unique per server, so each catalog entry is keyed by a flattened
//! identifier namespaced by its server (`{server}__{tool}`). The router keeps the reverse
//! mapping so a tool-use request from the model can be sent back to the right server.
//!
//! The catalog is rebuilt from the live connections for every query; it is never persisted.
//!
//! ```rust
//! use serde_json::json;
//! use toolrelay::tool_protocol::ToolDescriptor;
//! use toolrelay::tool_router::ToolRouter;
//!
//! let search = ToolDescriptor::new(
//!     "search",
//!     "Full text search",
//!     json!({"type": "object", "properties": {"q": {"type": "string"}}}),
//! );
//! let router = ToolRouter::from_server_tools(vec![
//!     ("docs", vec![search.clone()]),
//!     ("tickets", vec![search]),
//! ]);
//!
//! assert_eq!(router.catalog().len(), 2);
//! let (server, tool) = router.resolve("tickets__search").unwrap();
//! assert_eq!((server, tool), ("tickets", "search"));
//! ```

use crate::toolrelay::server_connection::ServerConnection;
use crate::toolrelay::tool_protocol::{ToolDescriptor, ToolError};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;

/// Longest tool name accepted by common inference backends.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Catalog plus reverse mapping for one query.
#[derive(Debug, Clone, Default)]
pub struct ToolRouter {
    catalog: Vec<ToolDescriptor>,
    routes: HashMap<String, (String, String)>,
}

impl ToolRouter {
    /// Build the catalog from every connected server, in connection order.
    pub fn build_catalog(connections: &[ServerConnection]) -> Self {
        Self::from_server_tools(connections.iter().filter_map(|conn| {
            conn.list_tools()
                .ok()
                .map(|tools| (conn.name(), tools.to_vec()))
        }))
    }

    /// Build the catalog from `(server_name, tools)` pairs.
    ///
    /// Tools whose schema does not declare an object-typed parameter set are skipped.
    pub fn from_server_tools<'a, I>(server_tools: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Vec<ToolDescriptor>)>,
    {
        let mut router = ToolRouter::default();
        for (server_name, tools) in server_tools {
            for tool in tools {
                let schema = match catalog_schema(&tool.input_schema) {
                    Some(schema) => schema,
                    None => {
                        log::debug!(
                            "Skipping {}.{}: no object parameter schema",
                            server_name,
                            tool.name
                        );
                        continue;
                    }
                };
                let id = router.unique_id(flatten_tool_id(server_name, &tool.name));
                router
                    .routes
                    .insert(id.clone(), (server_name.to_string(), tool.name.clone()));
                router.catalog.push(ToolDescriptor {
                    name: id,
                    description: format!("[{}] {}", server_name, tool.description),
                    input_schema: schema,
                });
            }
        }
        router
    }

    fn unique_id(&self, base: String) -> String {
        if !self.routes.contains_key(&base) {
            return base;
        }
        (2..)
            .map(|n| {
                let suffix = format!("_{}", n);
                let keep = MAX_TOOL_NAME_LEN.saturating_sub(suffix.len()).min(base.len());
                format!("{}{}", &base[..keep], suffix)
            })
            .find(|candidate| !self.routes.contains_key(candidate))
            .unwrap_or(base)
    }

    /// The LLM-facing catalog.
    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    /// Map a flattened identifier back to `(server_name, tool_name)`.
    pub fn resolve(&self, flattened_id: &str) -> Result<(&str, &str), ToolError> {
        self.routes
            .get(flattened_id)
            .map(|(server, tool)| (server.as_str(), tool.as_str()))
            .ok_or_else(|| ToolError::UnknownTool(flattened_id.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }
}

/// Deterministic, backend-safe identifier for `(server, tool)`.
///
/// Characters outside `[A-Za-z0-9_-]` become `_`; the result is capped at
/// [`MAX_TOOL_NAME_LEN`] characters.
pub fn flatten_tool_id(server_name: &str, tool_name: &str) -> String {
    format!("{}__{}", server_name, tool_name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect()
}

/// Reduce a server-reported schema to the object schema offered to the model.
fn catalog_schema(input_schema: &JsonValue) -> Option<JsonValue> {
    let schema = input_schema.as_object()?;
    match schema.get("type") {
        None => {}
        Some(JsonValue::String(t)) if t == "object" => {}
        Some(_) => return None,
    }
    let properties = schema.get("properties")?;
    if !properties.is_object() {
        return None;
    }

    let mut offered = json!({
        "type": "object",
        "properties": properties,
    });
    if let Some(required) = schema.get("required") {
        offered["required"] = required.clone();
    }
    Some(offered)
}
