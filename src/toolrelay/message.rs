//! Canonical representation of one conversational turn.
//!
//! A [`Message`] pairs a [`Role`] with an ordered list of [`ContentPart`]s. Content parts are
//! a closed set of variants so every consumer (memory validation, the inference gateway, the
//! orchestration loop) matches them exhaustively instead of probing loosely-shaped maps.
//!
//! # Example
//!
//! ```rust
//! use toolrelay::message::{ContentPart, Message, Role};
//! use serde_json::json;
//!
//! let request = Message::tool_request("call-1", "db__query", json!({"sql": "select 1"}));
//! let result = Message::tool_result("call-1", "1");
//!
//! assert_eq!(request.role, Role::Assistant);
//! assert_eq!(result.role, Role::User);
//! assert!(matches!(result.content[0], ContentPart::ToolResult { .. }));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A message sent by the human (or by the engine on their behalf, e.g. tool results).
    User,
    /// Content generated by the model.
    Assistant,
}

/// One structured piece of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// A tool invocation requested by the assistant.
    ToolRequest {
        id: String,
        tool_name: String,
        arguments: JsonValue,
    },
    /// The outcome of a tool invocation, keyed by the id of the originating request.
    ToolResult {
        id: String,
        payload: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentPart {
    /// Convenience constructor for a text part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Borrow the text when this is a [`ContentPart::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::ToolRequest { .. } | ContentPart::ToolResult { .. } => None,
        }
    }
}

/// An immutable conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// Ordered content parts.
    pub content: Vec<ContentPart>,
}

impl Message {
    /// A user message carrying a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentPart::text(text)],
        }
    }

    /// An assistant message carrying a single text part.
    pub fn assistant(text: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: vec![ContentPart::text(text)],
        }
    }

    /// An assistant message requesting one tool invocation.
    pub fn tool_request(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: JsonValue,
    ) -> Self {
        Message {
            role: Role::Assistant,
            content: vec![ContentPart::ToolRequest {
                id: id.into(),
                tool_name: tool_name.into(),
                arguments,
            }],
        }
    }

    /// A successful tool result, sent back with the user role.
    pub fn tool_result(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentPart::ToolResult {
                id: id.into(),
                payload: payload.into(),
                is_error: false,
            }],
        }
    }

    /// A tool result describing a failed invocation.
    pub fn tool_error(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentPart::ToolResult {
                id: id.into(),
                payload: payload.into(),
                is_error: true,
            }],
        }
    }

    /// Ids of every tool request carried by this message.
    pub fn tool_request_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolRequest { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Ids of every tool result carried by this message.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolResult { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Concatenated text of all text parts, separated by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_part_serializes_with_type_tag() {
        let part = ContentPart::ToolRequest {
            id: "t1".into(),
            tool_name: "pg__query".into(),
            arguments: json!({"sql": "select 1"}),
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool_request");
        assert_eq!(value["tool_name"], "pg__query");
    }

    #[test]
    fn test_message_ids() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentPart::text("thinking"),
                ContentPart::ToolRequest {
                    id: "a".into(),
                    tool_name: "x".into(),
                    arguments: json!({}),
                },
            ],
        };
        assert_eq!(msg.tool_request_ids().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(msg.tool_result_ids().count(), 0);
        assert_eq!(msg.text(), "thinking");
    }

    #[test]
    fn test_tool_error_is_flagged() {
        let msg = Message::tool_error("a", "boom");
        match &msg.content[0] {
            ContentPart::ToolResult { is_error, .. } => assert!(*is_error),
            other => panic!("unexpected part {:?}", other),
        }
    }
}
