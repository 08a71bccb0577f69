//! The tool contract, explicit-schema argument binding, and the registry
//! the Agent Runtime dispatches tool calls through.
//!
//! A single `name -> Arc<dyn Tool>` map, deliberately simpler than a
//! pluggable-protocol registry (local function, MCP client, ...) since that
//! plumbing is outside this crate's scope. What matters here is the
//! **schema-bound argument binding**: every call's raw JSON arguments are
//! validated against the tool's declared parameter schema before the tool
//! body ever runs, rather than left as free-text for the tool to parse.

use crate::message::{ParameterType, ToolDefinition};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Failure modes a tool dispatch can hit.
#[derive(Debug, Clone)]
pub enum ToolError {
    NotFound(String),
    InvalidArguments(String),
    ExecutionFailed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {name}"),
            ToolError::InvalidArguments(msg) => write!(f, "invalid arguments: {msg}"),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {msg}"),
        }
    }
}

impl Error for ToolError {}

/// A callable exposed to a model via [`ToolDefinition`]. Worker agents are
/// exposed as additional tool definitions (see
/// `crate::agent_def::worker_agent_tool_definition`) but are dispatched
/// directly by the Agent Runtime rather than going through this registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    /// Execute with already-bound, schema-validated arguments. Returning
    /// `Err` surfaces as a `function_call_output` with `status: incomplete`
    /// and the error's message — it is not a process-fatal
    /// condition.
    async fn call(&self, arguments: Value) -> Result<String, ToolError>;
}

/// Parse a tool call's raw JSON-string arguments and validate them against
/// the tool's declared schema.
///
/// - An empty string decodes to an empty object.
/// - Every `required` parameter must be present.
/// - Unknown keys are rejected unless [`ToolDefinition::open`] is set.
/// - The returned object's key order follows the schema's declaration
///   order (required by the explicit-parameter-schema design note), with
///   any tolerated extra keys (open schemas) appended in arrival order.
pub fn bind_arguments(def: &ToolDefinition, raw_arguments: &str) -> Result<Value, ToolError> {
    let raw: Value = if raw_arguments.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(raw_arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("malformed JSON: {e}")))?
    };

    let raw_obj = raw
        .as_object()
        .ok_or_else(|| ToolError::InvalidArguments("arguments must be a JSON object".into()))?;

    let mut bound = Map::new();
    for param in &def.parameters {
        match raw_obj.get(&param.name) {
            Some(value) => {
                validate_type(param.name.as_str(), &param.param_type, value)?;
                bound.insert(param.name.clone(), value.clone());
            }
            None if param.required => {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required parameter: {}",
                    param.name
                )));
            }
            None => {}
        }
    }

    let declared: std::collections::HashSet<&str> =
        def.parameters.iter().map(|p| p.name.as_str()).collect();
    for (key, value) in raw_obj.iter() {
        if declared.contains(key.as_str()) {
            continue;
        }
        if def.open {
            bound.insert(key.clone(), value.clone());
        } else {
            return Err(ToolError::InvalidArguments(format!(
                "unexpected parameter: {key}"
            )));
        }
    }

    Ok(Value::Object(bound))
}

fn validate_type(name: &str, expected: &ParameterType, value: &Value) -> Result<(), ToolError> {
    let ok = match expected {
        ParameterType::String => value.is_string(),
        ParameterType::Number => value.is_number(),
        ParameterType::Integer => value.is_i64() || value.is_u64(),
        ParameterType::Boolean => value.is_boolean(),
        ParameterType::Array => value.is_array(),
        ParameterType::Object => value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(format!(
            "parameter {name} has the wrong type"
        )))
    }
}

/// Maps tool names to implementations. A single, process-local registry is
/// built per runtime configuration (not per-turn) and shared via `Arc`
/// across concurrent agent turns — tool definitions are immutable once
/// registered, matching the "all other state is immutable" resource policy.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition().clone()).collect()
    }

    /// Bind and invoke a tool by name. This is the single call site the
    /// Agent Runtime's tool-dispatch step goes through.
    pub async fn execute(&self, name: &str, raw_arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let bound = bind_arguments(tool.definition(), raw_arguments)?;
        tool.call(bound).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolParameter;

    fn echo_def() -> ToolDefinition {
        ToolDefinition::new("echo", "echoes its input")
            .with_parameter(ToolParameter::new("text", ParameterType::String).required())
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> &ToolDefinition {
            // leaked once for the test's lifetime; fine in test code.
            Box::leak(Box::new(echo_def()))
        }

        async fn call(&self, arguments: Value) -> Result<String, ToolError> {
            Ok(arguments["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn empty_arguments_string_decodes_to_empty_object() {
        let def = ToolDefinition::new("noop", "does nothing");
        let bound = bind_arguments(&def, "").unwrap();
        assert_eq!(bound, Value::Object(Map::new()));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let def = echo_def();
        let err = bind_arguments(&def, "{}").unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn unknown_key_is_rejected_unless_open() {
        let def = echo_def();
        let err = bind_arguments(&def, r#"{"text":"hi","extra":1}"#).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let open_def = echo_def().open();
        let bound = bind_arguments(&open_def, r#"{"text":"hi","extra":1}"#).unwrap();
        assert_eq!(bound["extra"], 1);
    }

    #[tokio::test]
    async fn registry_executes_registered_tool_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let out = registry.execute("echo", r#"{"text":"hi"}"#).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn registry_reports_not_found_for_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("missing", "{}").await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
