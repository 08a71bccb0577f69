//! Integration coverage for the Agent Runtime crossing module boundaries:
//! provider selection/fallback, the tool registry, and the sub-agent-as-tool
//! adapter working together end to end.

use async_trait::async_trait;
use magi_core::agent_def::AgentDefinition;
use magi_core::event::StreamingEvent;
use magi_core::message::Message;
use magi_core::provider::{ModelProvider, ProviderError};
use magi_core::runtime::{AgentRuntime, ModelCatalog};
use magi_core::tool::{Tool, ToolError, ToolRegistry};
use magi_core::Role;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Feeds back whatever JSON under `"next"` a test wants emitted, letting
/// each test script a small, deterministic turn-by-turn conversation
/// without needing a real LLM.
struct ScriptedModel {
    turns: Vec<Vec<StreamingEvent>>,
    cursor: AtomicU32,
}

impl ScriptedModel {
    fn new(turns: Vec<Vec<StreamingEvent>>) -> Self {
        Self {
            turns,
            cursor: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    async fn create_response_stream(
        &self,
        _model: &str,
        _messages: &[Message],
        _agent: &AgentDefinition,
    ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
        let turn = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        let events = self.turns.get(turn).cloned().unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in events {
                let _ = tx.send(event).await;
            }
        });
        Ok(rx)
    }
}

struct UppercaseTool;

#[async_trait]
impl Tool for UppercaseTool {
    fn definition(&self) -> &magi_core::message::ToolDefinition {
        use magi_core::message::{ParameterType, ToolDefinition, ToolParameter};
        Box::leak(Box::new(
            ToolDefinition::new("uppercase", "uppercases the given text")
                .with_parameter(ToolParameter::new("text", ParameterType::String).required()),
        ))
    }

    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        Ok(arguments["text"].as_str().unwrap_or_default().to_uppercase())
    }
}

fn tool_done(name: &str, arguments: &str) -> StreamingEvent {
    StreamingEvent::ToolDone {
        message_id: "m".into(),
        order: 0,
        call_id: "c1".into(),
        name: name.into(),
        arguments: arguments.into(),
    }
}

fn message_complete(content: &str) -> StreamingEvent {
    StreamingEvent::MessageComplete {
        message_id: "m".into(),
        order: 0,
        content: content.into(),
        agent: None,
    }
}

#[tokio::test]
async fn a_tool_call_is_dispatched_and_its_output_feeds_back_into_the_next_turn() {
    let provider = Arc::new(ScriptedModel::new(vec![
        vec![tool_done("uppercase", r#"{"text":"hello"}"#)],
        vec![tool_done(
            "task_complete",
            r#"{"result":"the tool said HELLO"}"#,
        )],
    ]));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(UppercaseTool));

    let runtime = Arc::new(AgentRuntime::new(
        provider,
        Arc::new(registry),
        Arc::new(magi_core::CostTracker::new()),
        Arc::new(ModelCatalog::new()),
    ));

    let agent = Arc::new(
        AgentDefinition::new("a1", "Shouter").with_tool(UppercaseTool.definition().clone()),
    );
    let mut rx = runtime.run_streamed(agent, Some("shout hello".into()), Vec::new());

    let mut final_text = None;
    while let Some(event) = rx.recv().await {
        if let StreamingEvent::MessageComplete { content, .. } = event {
            final_text = Some(content);
        }
    }
    assert_eq!(final_text.as_deref(), Some("the tool said HELLO"));
}

#[tokio::test]
async fn parent_agent_delegates_to_a_worker_agent_and_forwards_its_events() {
    // The parent's first turn calls the auto-generated worker tool; the
    // worker's own turn (a fresh model-provider call) answers directly with
    // `task_complete`; the parent's second turn wraps that answer up.
    let provider = Arc::new(ScriptedModel::new(vec![
        vec![tool_done(
            "agent_researcher",
            r#"{"prompt":"look up the answer"}"#,
        )],
        vec![tool_done("task_complete", r#"{"result":"42"}"#)],
        vec![message_complete("the worker found: 42")],
    ]));

    let worker = Arc::new(AgentDefinition::new("w1", "Researcher"));
    let runtime = Arc::new(AgentRuntime::new(
        provider,
        Arc::new(ToolRegistry::new()),
        Arc::new(magi_core::CostTracker::new()),
        Arc::new(ModelCatalog::new()),
    ));
    let parent = Arc::new(AgentDefinition::new("p1", "Planner").with_worker_agent(worker.clone()));

    let mut rx = runtime.run_streamed(parent, Some("find the answer".into()), Vec::new());

    let mut saw_agent_start = false;
    let mut saw_agent_done = false;
    let mut final_text = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamingEvent::AgentStart { .. } => saw_agent_start = true,
            StreamingEvent::AgentDone { .. } => saw_agent_done = true,
            StreamingEvent::MessageComplete { content, .. } => final_text = Some(content),
            _ => {}
        }
    }

    assert!(saw_agent_start, "expected an agent_start event for the delegated worker");
    assert!(saw_agent_done, "expected an agent_done event once the worker finished");
    assert_eq!(final_text.as_deref(), Some("the worker found: 42"));
}

#[tokio::test]
async fn every_model_candidate_failing_surfaces_as_a_models_exhausted_error() {
    struct AlwaysFailingProvider;
    #[async_trait]
    impl ModelProvider for AlwaysFailingProvider {
        async fn create_response_stream(
            &self,
            _model: &str,
            _messages: &[Message],
            _agent: &AgentDefinition,
        ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
            Err(ProviderError::Fatal("no api key configured".into()))
        }
    }

    let runtime = Arc::new(AgentRuntime::new(
        Arc::new(AlwaysFailingProvider),
        Arc::new(ToolRegistry::new()),
        Arc::new(magi_core::CostTracker::new()),
        Arc::new(ModelCatalog::new().with_pool(
            magi_core::message::ModelClass::Standard,
            vec!["model-a".into(), "model-b".into()],
        )),
    ));
    let agent = Arc::new(AgentDefinition::new("a1", "Unlucky").with_model_class(
        magi_core::message::ModelClass::Standard,
    ));
    let mut rx = runtime.run_streamed(agent, Some("hi".into()), Vec::new());

    let mut saw_exhausted = false;
    while let Some(event) = rx.recv().await {
        if let StreamingEvent::Error { message, .. } = event {
            if message.contains("every candidate model failed") {
                saw_exhausted = true;
            }
        }
    }
    assert!(saw_exhausted);
}

#[tokio::test]
async fn conversation_history_is_seeded_with_system_instructions_once() {
    struct EchoFirstMessageProvider;
    #[async_trait]
    impl ModelProvider for EchoFirstMessageProvider {
        async fn create_response_stream(
            &self,
            _model: &str,
            messages: &[Message],
            _agent: &AgentDefinition,
        ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
            let system_count = messages
                .iter()
                .filter(|m| matches!(m, Message::Text { role: Role::System, .. }))
                .count();
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(message_complete(&format!("system_messages={system_count}")))
                    .await;
            });
            Ok(rx)
        }
    }

    let runtime = Arc::new(AgentRuntime::new(
        Arc::new(EchoFirstMessageProvider),
        Arc::new(ToolRegistry::new()),
        Arc::new(magi_core::CostTracker::new()),
        Arc::new(ModelCatalog::new()),
    ));
    let agent = Arc::new(AgentDefinition::new("a1", "Scribe").with_instructions("be terse"));
    let mut rx = runtime.run_streamed(agent, Some("hi".into()), Vec::new());

    let mut content = None;
    while let Some(event) = rx.recv().await {
        if let StreamingEvent::MessageComplete { content: c, .. } = event {
            content = Some(c);
        }
    }
    assert_eq!(content.as_deref(), Some("system_messages=1"));
}
