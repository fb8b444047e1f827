use serde::{Deserialize, Serialize};

/// A tool description exposed by an agent, as returned from `Agent::tools`.
/// Opaque beyond name/description/schema — the runner never inspects the
/// schema itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Author role of a choice within an event's response, or of a seed
/// message. Provider-agnostic — mirrors the teacher's message role model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A fragment of a choice's content. Most turns carry a single `Text`
/// part; multi-part choices appear when an agent interleaves tool calls
/// or tool results inside one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_call")]
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentPart {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// One choice inside an event's `response`. `content` carries the plain
/// text; `content_parts` carries the structured breakdown (tool calls,
/// tool results) when the choice is more than a flat text turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Choice {
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Choice {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: Some(content.into()),
            content_parts: Vec::new(),
            finish_reason: None,
        }
    }

    /// Whether this choice carries any renderable content: a non-empty
    /// `content` string, or at least one non-empty text content-part.
    pub fn has_valid_content(&self) -> bool {
        if self.content.as_deref().is_some_and(|c| !c.is_empty()) {
            return true;
        }
        self.content_parts
            .iter()
            .any(|p| p.text().is_some_and(|t| !t.is_empty()))
    }

    /// Extract all text: the flat `content` field if present, else the
    /// concatenation of text content-parts.
    pub fn extract_text(&self) -> String {
        if let Some(c) = &self.content {
            if !c.is_empty() {
                return c.clone();
            }
        }
        self.content_parts
            .iter()
            .filter_map(|p| p.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
