//! The static configuration of an agent: instructions, tools, model policy,
//! and lifecycle hooks.
//!
//! Built with a consuming-builder idiom (`with_*` methods), generalized to
//! carry the model class pool and worker-agent list an agent needs.

use crate::message::{AgentExport, ModelClass, ParameterType, ToolDefinition, ToolCall, ToolParameter};
use crate::tool::ToolError;
use async_trait::async_trait;
use std::sync::Arc;

/// Name of the control-flow signal tool that ends a turn successfully with
/// a final result.
pub const TASK_COMPLETE_TOOL: &str = "task_complete";
/// Name of the control-flow signal tool that ends a turn with a fatal,
/// non-retryable error.
pub const TASK_FATAL_ERROR_TOOL: &str = "task_fatal_error";

fn task_complete_definition() -> ToolDefinition {
    ToolDefinition::new(
        TASK_COMPLETE_TOOL,
        "Signal that the task is finished and return its final result.",
    )
    .with_parameter(ToolParameter::new("result", ParameterType::String).required())
}

fn task_fatal_error_definition() -> ToolDefinition {
    ToolDefinition::new(
        TASK_FATAL_ERROR_TOOL,
        "Signal that the task cannot proceed and abort with an error message.",
    )
    .with_parameter(ToolParameter::new("error", ParameterType::String).required())
}

/// Optional callbacks fired at well-known points of a turn. Every method
/// has a no-op default, so a caller only implements the hooks it needs.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_request(&self, _instructions: &str, _input: &str) {}
    async fn on_response(&self, _text: &str) {}
    async fn on_thinking(&self, _text: &str) {}
    async fn on_tool_call(&self, _call: &ToolCall) {}
    async fn on_tool_result(&self, _call_id: &str, _result: &Result<String, ToolError>) {}
}

/// Hooks implementation that does nothing; the default for agents that
/// don't need lifecycle observation.
pub struct NoopHooks;

#[async_trait]
impl AgentHooks for NoopHooks {
    async fn on_request(&self, _instructions: &str, _input: &str) {}
    async fn on_response(&self, _text: &str) {}
    async fn on_thinking(&self, _text: &str) {}
    async fn on_tool_call(&self, _call: &ToolCall) {}
    async fn on_tool_result(&self, _call_id: &str, _result: &Result<String, ToolError>) {}
}

/// A named, reusable agent configuration. Cheap to clone: tools and worker
/// agents are shared via `Arc`/owned small vectors, and `fork` (used by the
/// sub-agent-as-tool adapter to keep recursion tree-shaped) is just `Clone`
/// plus a fresh `id`.
#[derive(Clone)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub tools: Vec<ToolDefinition>,
    pub explicit_model: Option<String>,
    pub model_class: Option<ModelClass>,
    pub model_class_pool: Vec<String>,
    pub worker_agents: Vec<Arc<AgentDefinition>>,
    pub max_tool_call_rounds_per_turn: u32,
    /// If true (default), tool calls within one round are serialized one at
    /// a time; if false, they are dispatched concurrently.
    pub sequential: bool,
    pub hooks: Arc<dyn AgentHooks>,
}

/// Default per-turn cap on tool-call rounds when an agent doesn't override
/// it.
pub const DEFAULT_MAX_TOOL_CALL_ROUNDS: u32 = 8;

impl AgentDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            // Every agent can signal completion/failure regardless of what
            // domain tools it's given; callers never
            // have to remember to wire these up by hand.
            tools: vec![task_complete_definition(), task_fatal_error_definition()],
            explicit_model: None,
            model_class: None,
            model_class_pool: Vec::new(),
            worker_agents: Vec::new(),
            max_tool_call_rounds_per_turn: DEFAULT_MAX_TOOL_CALL_ROUNDS,
            sequential: true,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_explicit_model(mut self, model: impl Into<String>) -> Self {
        self.explicit_model = Some(model.into());
        self
    }

    pub fn with_model_class(mut self, class: ModelClass) -> Self {
        self.model_class = Some(class);
        self
    }

    /// Candidate model names for `self.model_class`, tried in order before
    /// falling back to the `standard` class.
    pub fn with_model_class_pool(mut self, models: Vec<String>) -> Self {
        self.model_class_pool = models;
        self
    }

    pub fn with_worker_agent(mut self, agent: Arc<AgentDefinition>) -> Self {
        self.worker_agents.push(agent);
        self
    }

    pub fn with_max_tool_call_rounds(mut self, max: u32) -> Self {
        self.max_tool_call_rounds_per_turn = max;
        self
    }

    pub fn with_sequential_tools(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The full tool list a model sees for this agent: its declared tools
    /// plus one auto-generated tool per worker agent. `AgentRuntime` dispatches calls to these
    /// generated names by recursing into the worker agent rather than
    /// looking them up in the tool registry.
    pub fn tool_definitions_for_model(&self) -> Vec<ToolDefinition> {
        let mut defs = self.tools.clone();
        for worker in &self.worker_agents {
            defs.push(worker_agent_tool_definition(worker));
        }
        defs
    }

    /// The subset of this definition used to label events.
    pub fn export(&self, parent: Option<String>) -> AgentExport {
        AgentExport {
            agent_id: self.id.clone(),
            name: self.name.clone(),
            model: self.explicit_model.clone(),
            parent,
        }
    }

    /// Clone this definition for a single on-demand invocation (e.g. the
    /// sub-agent-as-tool adapter), giving the copy a fresh id so concurrent
    /// invocations of the same agent don't alias identity in event labels.
    pub fn fork(&self, new_id: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.id = new_id.into();
        copy
    }
}

/// The tool name and schema a worker agent is exposed under when it is
/// invocable as a tool:
/// `{prompt: string (required), working_directory: string (optional)}`.
pub fn worker_agent_tool_definition(worker: &AgentDefinition) -> ToolDefinition {
    ToolDefinition::new(
        worker_agent_tool_name(worker),
        format!("Delegate a task to the '{}' agent: {}", worker.name, worker.description),
    )
    .with_parameter(ToolParameter::new("prompt", ParameterType::String).required())
    .with_parameter(ToolParameter::new("working_directory", ParameterType::String))
}

/// Stable tool name derived from a worker agent's identity. Sanitized so an
/// agent name with spaces/punctuation still yields a valid tool-call name.
pub fn worker_agent_tool_name(worker: &AgentDefinition) -> String {
    let slug: String = worker
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("agent_{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_preserves_configuration_but_changes_id() {
        let agent = AgentDefinition::new("a1", "Researcher")
            .with_instructions("Be thorough")
            .with_model_class(ModelClass::Reasoning);

        let forked = agent.fork("a1-invocation-7");
        assert_eq!(forked.id, "a1-invocation-7");
        assert_eq!(forked.name, "Researcher");
        assert_eq!(forked.instructions, "Be thorough");
        assert_eq!(forked.model_class, Some(ModelClass::Reasoning));
    }

    #[test]
    fn export_carries_parent_link() {
        let agent = AgentDefinition::new("child", "Child");
        let export = agent.export(Some("parent-1".into()));
        assert_eq!(export.parent.as_deref(), Some("parent-1"));
        assert_eq!(export.agent_id, "child");
    }

    #[test]
    fn new_agent_can_always_signal_completion_and_fatal_error() {
        let agent = AgentDefinition::new("a1", "Researcher");
        let names: Vec<&str> = agent.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&TASK_COMPLETE_TOOL));
        assert!(names.contains(&TASK_FATAL_ERROR_TOOL));
    }

    #[test]
    fn worker_agents_are_exposed_as_additional_tool_definitions() {
        let worker = Arc::new(AgentDefinition::new("w1", "Web Researcher"));
        let parent = AgentDefinition::new("p1", "Planner").with_worker_agent(worker.clone());
        let defs = parent.tool_definitions_for_model();
        let worker_tool_name = worker_agent_tool_name(&worker);
        assert_eq!(worker_tool_name, "agent_web_researcher");
        assert!(defs.iter().any(|d| d.name == worker_tool_name));
    }
}
