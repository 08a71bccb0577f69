//! The Agent Runtime: runs one agent over one input,
//! streaming events and recursively dispatching tool calls — including
//! sub-agents exposed as tools.
//!
//! A generalized `send`/tool-calling turn loop, with two deliberate design
//! choices: tool calls are read off the provider's structured
//! `tool_start`/`tool_delta`/`tool_done` events (never parsed out of
//! assistant text), and `task_complete`/`task_fatal_error` are an explicit
//! [`ToolDispatchOutcome`] returned by the dispatcher rather than exceptions
//! standing in for control flow.

use crate::agent_def::{AgentDefinition, TASK_COMPLETE_TOOL, TASK_FATAL_ERROR_TOOL};
use crate::cost::CostTracker;
use crate::event::{OrderCounter, StreamingEvent};
use crate::message::{AgentExport, Message, ModelClass, ToolCall};
use crate::provider::ModelProvider;
use crate::tool::{ToolError, ToolRegistry};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default bound on total tool calls across every round of a single turn,
/// independent of the per-round `max_tool_call_rounds_per_turn` budget.
pub const DEFAULT_MAX_TOTAL_TOOL_CALLS: u32 = 64;

/// Outcome of dispatching one tool call, replacing exceptions-as-control-flow
/// with an explicit result the turn loop matches
/// on.
#[derive(Debug, Clone)]
pub enum ToolDispatchOutcome {
    /// An ordinary tool ran (or failed) and produced a function-call-output
    /// to feed back into the conversation.
    Continue(Result<String, ToolError>),
    /// `task_complete` was called: unwind with this final result.
    Complete(String),
    /// `task_fatal_error` was called: unwind with this error message.
    Fatal(String),
}

#[derive(Debug, Clone)]
pub enum RuntimeError {
    ModelsExhausted,
    ToolRoundBudgetExceeded(u32),
    TotalToolCallBudgetExceeded(u32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::ModelsExhausted => {
                write!(f, "every candidate model failed before producing a response")
            }
            RuntimeError::ToolRoundBudgetExceeded(max) => {
                write!(f, "exceeded the per-turn tool-call round budget ({max})")
            }
            RuntimeError::TotalToolCallBudgetExceeded(max) => {
                write!(f, "exceeded the total tool-call budget for this turn ({max})")
            }
        }
    }
}

impl Error for RuntimeError {}

/// Model candidates per [`ModelClass`], plus the `standard` pool every
/// exhausted selection ultimately falls back to.
#[derive(Default, Clone)]
pub struct ModelCatalog {
    pools: HashMap<ModelClass, Vec<String>>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, class: ModelClass, models: Vec<String>) -> Self {
        self.pools.insert(class, models);
        self
    }

    pub fn pool_for(&self, class: ModelClass) -> Vec<String> {
        self.pools.get(&class).cloned().unwrap_or_default()
    }

    pub fn standard_pool(&self) -> Vec<String> {
        self.pool_for(ModelClass::Standard)
    }
}

/// Ordered, de-duplicated list of models to try for one turn: the agent's
/// explicit model or model-class pool first, then the catalog's `standard`
/// pool as the final fallback.
fn candidate_models(agent: &AgentDefinition, catalog: &ModelCatalog) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let primary: Vec<String> = if let Some(model) = &agent.explicit_model {
        vec![model.clone()]
    } else if !agent.model_class_pool.is_empty() {
        agent.model_class_pool.clone()
    } else if let Some(class) = agent.model_class {
        catalog.pool_for(class)
    } else {
        Vec::new()
    };

    for model in primary.into_iter().chain(catalog.standard_pool()) {
        if seen.insert(model.clone()) {
            candidates.push(model);
        }
    }
    candidates
}

/// A provider stream with its already-consumed first event buffered back in
/// front, so a model-selection probe ("does this candidate fail before
/// producing any assistant event?") doesn't lose that event.
struct PeekedStream {
    buffered: Option<StreamingEvent>,
    rx: mpsc::Receiver<StreamingEvent>,
}

impl PeekedStream {
    async fn recv(&mut self) -> Option<StreamingEvent> {
        if let Some(event) = self.buffered.take() {
            return Some(event);
        }
        self.rx.recv().await
    }
}

fn tag_with_agent(event: StreamingEvent, export: &AgentExport) -> StreamingEvent {
    match event {
        StreamingEvent::MessageStart { message_id, order, .. } => StreamingEvent::MessageStart {
            message_id,
            order,
            agent: Some(export.clone()),
        },
        StreamingEvent::MessageDelta { message_id, order, text, .. } => StreamingEvent::MessageDelta {
            message_id,
            order,
            text,
            agent: Some(export.clone()),
        },
        StreamingEvent::MessageComplete { message_id, order, content, .. } => StreamingEvent::MessageComplete {
            message_id,
            order,
            content,
            agent: Some(export.clone()),
        },
        other => other,
    }
}

/// Executes a single [`AgentDefinition`] for a single input: model
/// selection/fallback, prompt assembly, tool dispatch (including sub-agents
/// exposed as tools), and the completion signals.
pub struct AgentRuntime {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    cost_tracker: Arc<CostTracker>,
    catalog: Arc<ModelCatalog>,
    max_total_tool_calls: u32,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        cost_tracker: Arc<CostTracker>,
        catalog: Arc<ModelCatalog>,
    ) -> Self {
        Self {
            provider,
            tools,
            cost_tracker,
            catalog,
            max_total_tool_calls: DEFAULT_MAX_TOTAL_TOOL_CALLS,
        }
    }

    pub fn with_max_total_tool_calls(mut self, max: u32) -> Self {
        self.max_total_tool_calls = max;
        self
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost_tracker
    }

    /// `runStreamed(agent, input, history) -> lazy StreamingEvent sequence`.
    ///
    /// Returns immediately with the receiver half of a channel; the turn
    /// runs in a detached task that forwards every event as it's produced.
    pub fn run_streamed(
        self: &Arc<Self>,
        agent: Arc<AgentDefinition>,
        input: Option<String>,
        history: Vec<Message>,
    ) -> mpsc::Receiver<StreamingEvent> {
        let (tx, rx) = mpsc::channel::<StreamingEvent>(256);
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.run_turn_loop(agent, input, history, tx).await;
        });
        rx
    }

    async fn run_turn_loop(
        self: &Arc<Self>,
        agent: Arc<AgentDefinition>,
        input: Option<String>,
        history: Vec<Message>,
        tx: mpsc::Sender<StreamingEvent>,
    ) {
        let export = agent.export(None);
        let mut order = OrderCounter::new();

        let mut working_history = history;
        if !matches!(working_history.first(), Some(Message::Text { role: crate::message::Role::System, .. }) | Some(Message::Text { role: crate::message::Role::Developer, .. }))
        {
            working_history.insert(0, Message::system(agent.instructions.clone()));
        }
        if let Some(input) = &input {
            agent.hooks.on_request(&agent.instructions, input).await;
            working_history.push(Message::user(input.clone()));
        }

        let mut round: u32 = 0;
        let mut total_tool_calls: u32 = 0;

        loop {
            round += 1;
            if round > agent.max_tool_call_rounds_per_turn {
                let _ = tx
                    .send(StreamingEvent::Error {
                        message_id: export.agent_id.clone(),
                        order: order.next(),
                        message: RuntimeError::ToolRoundBudgetExceeded(agent.max_tool_call_rounds_per_turn)
                            .to_string(),
                    })
                    .await;
                return;
            }

            let candidates = candidate_models(&agent, &self.catalog);
            let mut stream = match self.select_model_stream(&candidates, &working_history, &agent).await {
                Some(stream) => stream,
                None => {
                    let _ = tx
                        .send(StreamingEvent::Error {
                            message_id: export.agent_id.clone(),
                            order: order.next(),
                            message: RuntimeError::ModelsExhausted.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let mut assistant_text = String::new();
            let mut pending_calls: Vec<ToolCall> = Vec::new();
            let mut partial_calls: HashMap<String, ToolCall> = HashMap::new();
            let mut stream_failed = false;

            while let Some(event) = stream.recv().await {
                if let StreamingEvent::CostUpdate { .. } = &event {
                    // already recorded into the shared CostTracker by the
                    // provider; just forward for observability.
                }
                match &event {
                    StreamingEvent::MessageDelta { text, .. } => assistant_text.push_str(text),
                    StreamingEvent::MessageComplete { content, .. } => {
                        if assistant_text.is_empty() {
                            assistant_text = content.clone();
                        }
                    }
                    StreamingEvent::ToolStart { call_id, name, .. } => {
                        partial_calls.insert(
                            call_id.clone(),
                            ToolCall {
                                id: call_id.clone(),
                                name: name.clone(),
                                arguments: String::new(),
                            },
                        );
                    }
                    StreamingEvent::ToolDelta { call_id, arguments_fragment, .. } => {
                        if let Some(call) = partial_calls.get_mut(call_id) {
                            call.arguments.push_str(arguments_fragment);
                        }
                    }
                    StreamingEvent::ToolDone { call_id, name, arguments, .. } => {
                        partial_calls.remove(call_id);
                        pending_calls.push(ToolCall {
                            id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        });
                    }
                    StreamingEvent::ThinkingDelta { text, .. } => {
                        agent.hooks.on_thinking(text).await;
                    }
                    StreamingEvent::Error { .. } => stream_failed = true,
                    _ => {}
                }
                let tagged = tag_with_agent(event, &export);
                if tx.send(tagged).await.is_err() {
                    return;
                }
            }

            if !assistant_text.is_empty() {
                agent.hooks.on_response(&assistant_text).await;
            }

            if stream_failed {
                return;
            }

            if pending_calls.is_empty() {
                return;
            }

            let outcomes = self.dispatch_round(&agent, &pending_calls, &export, &tx).await;

            for (call, outcome) in pending_calls.into_iter().zip(outcomes) {
                total_tool_calls += 1;
                if total_tool_calls > self.max_total_tool_calls {
                    let _ = tx
                        .send(StreamingEvent::Error {
                            message_id: export.agent_id.clone(),
                            order: order.next(),
                            message: RuntimeError::TotalToolCallBudgetExceeded(self.max_total_tool_calls)
                                .to_string(),
                        })
                        .await;
                    return;
                }
                agent.hooks.on_tool_result(&call.id, &to_hook_result(&outcome)).await;

                match outcome {
                    ToolDispatchOutcome::Complete(result) => {
                        let _ = tx
                            .send(StreamingEvent::MessageComplete {
                                message_id: export.agent_id.clone(),
                                order: order.next(),
                                content: result,
                                agent: Some(export.clone()),
                            })
                            .await;
                        return;
                    }
                    ToolDispatchOutcome::Fatal(error) => {
                        let _ = tx
                            .send(StreamingEvent::Error {
                                message_id: export.agent_id.clone(),
                                order: order.next(),
                                message: error,
                            })
                            .await;
                        return;
                    }
                    ToolDispatchOutcome::Continue(result) => {
                        working_history.push(Message::FunctionCall {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        });
                        let (output, status) = match result {
                            Ok(output) => (output, crate::message::MessageStatus::Completed),
                            Err(err) => (err.to_string(), crate::message::MessageStatus::Incomplete),
                        };
                        working_history.push(Message::FunctionCallOutput {
                            call_id: call.id,
                            name: call.name,
                            output,
                            status,
                        });
                    }
                }
            }
            // At least one tool ran: start a new turn with the expanded
            // history and no new user input.
        }
    }

    /// Try each candidate model in order; a candidate "fails" for selection
    /// purposes if the provider call itself errors, the stream closes with
    /// no events, or its very first event is an `Error`.
    async fn select_model_stream(
        &self,
        candidates: &[String],
        history: &[Message],
        agent: &AgentDefinition,
    ) -> Option<PeekedStream> {
        for model in candidates {
            let stream = match self.provider.create_response_stream(model, history, agent).await {
                Ok(rx) => rx,
                Err(_) => continue,
            };
            let mut rx = stream;
            match rx.recv().await {
                Some(StreamingEvent::Error { .. }) => continue,
                Some(event) => {
                    return Some(PeekedStream { buffered: Some(event), rx });
                }
                None => continue,
            }
        }
        None
    }

    /// Dispatch every tool call of one round. Sequential agents (the
    /// default) run them one at a time in call order; `sequential=false`
    /// agents run them concurrently and results are zipped back in the
    /// original order.
    async fn dispatch_round(
        self: &Arc<Self>,
        agent: &Arc<AgentDefinition>,
        calls: &[ToolCall],
        export: &AgentExport,
        tx: &mpsc::Sender<StreamingEvent>,
    ) -> Vec<ToolDispatchOutcome> {
        if agent.sequential {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                agent.hooks.on_tool_call(call).await;
                outcomes.push(self.dispatch_one(agent, call, export, tx).await);
            }
            outcomes
        } else {
            let futures = calls.iter().map(|call| {
                let agent = agent.clone();
                let call = call.clone();
                let export = export.clone();
                let tx = tx.clone();
                let runtime = self.clone();
                async move {
                    agent.hooks.on_tool_call(&call).await;
                    runtime.dispatch_one(&agent, &call, &export, &tx).await
                }
            });
            futures_util::future::join_all(futures).await
        }
    }

    async fn dispatch_one(
        self: &Arc<Self>,
        agent: &Arc<AgentDefinition>,
        call: &ToolCall,
        export: &AgentExport,
        tx: &mpsc::Sender<StreamingEvent>,
    ) -> ToolDispatchOutcome {
        if call.name == TASK_COMPLETE_TOOL {
            return match parse_signal_argument(&call.arguments, "result") {
                Ok(result) => ToolDispatchOutcome::Complete(result),
                Err(err) => ToolDispatchOutcome::Continue(Err(err)),
            };
        }
        if call.name == TASK_FATAL_ERROR_TOOL {
            return match parse_signal_argument(&call.arguments, "error") {
                Ok(error) => ToolDispatchOutcome::Fatal(error),
                Err(err) => ToolDispatchOutcome::Continue(Err(err)),
            };
        }

        if let Some(worker) = agent
            .worker_agents
            .iter()
            .find(|w| crate::agent_def::worker_agent_tool_name(w) == call.name)
        {
            return ToolDispatchOutcome::Continue(
                self.invoke_subagent(worker, &call.arguments, export, tx).await,
            );
        }

        ToolDispatchOutcome::Continue(self.tools.execute(&call.name, &call.arguments).await)
    }

    /// The sub-agent-as-tool adapter: forks the worker
    /// agent so recursive invocations never alias identity, runs it with no
    /// prior history, aggregates its text output, and forwards every event
    /// it produces onto the outer stream.
    async fn invoke_subagent(
        self: &Arc<Self>,
        worker: &Arc<AgentDefinition>,
        raw_arguments: &str,
        parent_export: &AgentExport,
        tx: &mpsc::Sender<StreamingEvent>,
    ) -> Result<String, ToolError> {
        let args: serde_json::Value = if raw_arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(raw_arguments)
                .map_err(|e| ToolError::InvalidArguments(format!("malformed JSON: {e}")))?
        };
        let prompt = args
            .get("prompt")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("missing required parameter: prompt".into()))?
            .to_string();

        let forked = Arc::new(worker.fork(format!("{}-{}", worker.id, uuid::Uuid::new_v4())));
        let mut order = OrderCounter::new();
        let _ = tx
            .send(StreamingEvent::AgentStart {
                message_id: forked.id.clone(),
                order: order.next(),
                agent: forked.export(Some(parent_export.agent_id.clone())),
            })
            .await;

        let mut sub_rx = self.run_streamed(forked.clone(), Some(prompt), Vec::new());
        let mut aggregated = String::new();
        let mut saw_complete = false;
        while let Some(event) = sub_rx.recv().await {
            match &event {
                StreamingEvent::MessageDelta { text, .. } => aggregated.push_str(text),
                StreamingEvent::MessageComplete { content, .. } => {
                    aggregated = content.clone();
                    saw_complete = true;
                }
                _ => {}
            }
            if tx.send(event).await.is_err() {
                break;
            }
        }
        let _ = tx
            .send(StreamingEvent::AgentDone {
                message_id: forked.id.clone(),
                order: order.next(),
                agent: forked.export(Some(parent_export.agent_id.clone())),
            })
            .await;

        if !saw_complete && aggregated.is_empty() {
            return Err(ToolError::ExecutionFailed(format!(
                "worker agent '{}' produced no output",
                worker.name
            )));
        }
        Ok(aggregated)
    }
}

fn parse_signal_argument(raw_arguments: &str, key: &str) -> Result<String, ToolError> {
    let value: serde_json::Value = if raw_arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(raw_arguments)
            .map_err(|e| ToolError::InvalidArguments(format!("malformed JSON: {e}")))?
    };
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required parameter: {key}")))
}

fn to_hook_result(outcome: &ToolDispatchOutcome) -> Result<String, ToolError> {
    match outcome {
        ToolDispatchOutcome::Continue(result) => result.clone(),
        ToolDispatchOutcome::Complete(result) => Ok(result.clone()),
        ToolDispatchOutcome::Fatal(error) => Err(ToolError::ExecutionFailed(error.clone())),
    }
}
