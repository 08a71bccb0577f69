//! The conversation data model: messages, tool definitions, tool calls, and
//! the agent-identity export used to label events.
//!
//! Messages are a tagged variant rather than a single flat text message,
//! since a tool-calling, multi-modal agent loop needs to distinguish plain
//! text, a provider "thinking" trace, a function call, and a function
//! call's output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who produced a [`Message`].
///
/// `Assistant` messages are produced exclusively by the runtime; a `Message`
/// with `role: Assistant` constructed anywhere else is a bug in the caller,
/// not a state the runtime needs to guard against defensively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Developer,
}

/// Completion state of a text or function-call-output message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Completed,
    Incomplete,
}

/// Level of detail requested for an image part, passed through to providers
/// that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDetail {
    High,
    Low,
    Auto,
}

/// One piece of a multi-part text message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    InputImage {
        detail: ImageDetail,
        /// Either a remote URL or an inline provider-specific id.
        source: String,
    },
    InputFile {
        name: String,
        source: String,
    },
}

/// The content of a text message: either a plain string or an ordered list
/// of parts (text interleaved with images/files).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextContent {
    Plain(String),
    Parts(Vec<ContentPart>),
}

impl TextContent {
    /// Concatenate the textual portions of this content, dropping any
    /// image/file parts. Used when a provider or adapter needs a flat
    /// string view (prompt concatenation for the CLI-over-PTY provider,
    /// aggregation in the sub-agent-as-tool adapter).
    pub fn as_flat_text(&self) -> String {
        match self {
            TextContent::Plain(s) => s.clone(),
            TextContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::InputText { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Tagged variant covering every shape a conversation entry can take.
///
/// Invariant (enforced by the Agent Runtime, not by this type): every
/// [`Message::FunctionCallOutput`] must reference a preceding
/// [`Message::FunctionCall`] with the same `call_id` within the same
/// history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Text {
        role: Role,
        content: TextContent,
        status: MessageStatus,
    },
    Thinking {
        content: String,
        /// Opaque provider blob that lets a later turn round-trip reasoning
        /// state back to the same provider. Never interpreted by the core.
        signature: Option<String>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        /// Arguments as a JSON-encoded string, exactly as received from the
        /// provider — not yet parsed.
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        name: String,
        output: String,
        status: MessageStatus,
    },
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Message::Text {
            role,
            content: TextContent::Plain(content.into()),
            status: MessageStatus::Completed,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::text(Role::User, content)
    }

    pub fn developer(content: impl Into<String>) -> Self {
        Message::text(Role::Developer, content)
    }

    /// Flattened text view used by providers that only understand plain
    /// strings (the CLI-over-PTY provider's prompt concatenation, and the
    /// sub-agent-as-tool adapter's result aggregation).
    pub fn as_flat_text(&self) -> String {
        match self {
            Message::Text { content, .. } => content.as_flat_text(),
            Message::Thinking { content, .. } => content.clone(),
            Message::FunctionCall { name, arguments, .. } => {
                format!("[call {name}({arguments})]")
            }
            Message::FunctionCallOutput { name, output, .. } => {
                format!("[{name} -> {output}]")
            }
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Message::FunctionCall { call_id, .. } => Some(call_id),
            Message::FunctionCallOutput { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// JSON-schema-ish type tag for a tool parameter, used by the explicit-schema
/// argument binding the tool registry performs before a call ever reaches a
/// tool body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One parameter in a tool's declared schema. Parameters are bound to the
/// tool's call arguments **by name, in declaration order** — the ad-hoc
/// "parse the function signature as text" binding the legacy design used is
/// explicitly not reproduced here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParameterType,
    pub description: Option<String>,
    pub required: bool,
    /// For `ParameterType::Array`, the element type's name (informational;
    /// schema export only).
    pub items: Option<String>,
    /// Allowed literal values, if this parameter is an enum.
    pub enum_values: Option<Vec<serde_json::Value>>,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            items: None,
            enum_values: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_items(mut self, items: impl Into<String>) -> Self {
        self.items = Some(items.into());
        self
    }

    pub fn with_enum_values(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// A tool's static interface: name, description, and parameter schema.
///
/// `open` controls whether [`crate::tool::bind_arguments`] rejects argument
/// keys absent from `parameters` (the default) or tolerates them
/// unmodified, per the explicit-schema design note that unknown keys are
/// rejected "unless schema marks the object open".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub open: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            open: false,
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn open(mut self) -> Self {
        self.open = true;
        self
    }
}

/// A single tool invocation requested by a model, correlated back to its
/// eventual [`Message::FunctionCallOutput`] by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded argument object, exactly as assembled from
    /// `tool_start`/`tool_delta`/`tool_done` events.
    pub arguments: String,
}

/// The closed set of model-capability tiers an [`crate::agent_def::AgentDefinition`]
/// can request a model from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Reasoning,
    Standard,
    Mini,
    Code,
    Vision,
    Search,
    Summary,
    Monologue,
    ImageGeneration,
}

/// Per-model usage reported by a provider after a turn completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

/// Labeling metadata attached to every [`crate::event::StreamingEvent`] so a
/// consumer observing an interleaved multi-agent stream can tell which agent
/// produced which event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExport {
    pub agent_id: String,
    pub name: String,
    pub model: Option<String>,
    pub parent: Option<String>,
}

/// Extra metadata a tool's HashMap-shaped output may carry back to the
/// runtime — a narrow escape hatch rather than a full protocol-metadata map.
pub type ToolMetadataMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_text_concatenates_text_parts_only() {
        let content = TextContent::Parts(vec![
            ContentPart::InputText { text: "hello ".into() },
            ContentPart::InputImage {
                detail: ImageDetail::Auto,
                source: "img://1".into(),
            },
            ContentPart::InputText { text: "world".into() },
        ]);
        assert_eq!(content.as_flat_text(), "hello world");
    }

    #[test]
    fn call_id_is_present_only_on_call_and_output_variants() {
        let call = Message::FunctionCall {
            call_id: "c1".into(),
            name: "lookup".into(),
            arguments: "{}".into(),
        };
        assert_eq!(call.call_id(), Some("c1"));

        let text = Message::user("hi");
        assert_eq!(text.call_id(), None);
    }

    #[test]
    fn empty_arguments_string_is_preserved_verbatim() {
        let call = ToolCall {
            id: "1".into(),
            name: "noop".into(),
            arguments: String::new(),
        };
        assert_eq!(call.arguments, "");
    }
}
