//! The Pipeline Runner: a named stage map with per-stage
//! and global retry budgets, executed sequentially over the Agent Runtime.
//!
//! A single data-driven stage graph in place of a fixed set of
//! collaboration modes: each stage decides the next stage's name from its
//! own output instead of going through a hard-coded mode match.

use crate::agent_def::AgentDefinition;
use crate::event::StreamingEvent;
use crate::message::{Message, Role};
use crate::runtime::AgentRuntime;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Builds the effective history a stage's agent sees, given the pipeline's
/// running history and the outputs recorded so far. Defaults to passing
/// `history` through unchanged when a stage doesn't supply one.
pub type InputFn = Arc<dyn Fn(&[Message], &HashMap<String, String>) -> Vec<Message> + Send + Sync>;

/// Builds the agent a stage runs, given the history that `InputFn` produced.
pub type AgentFactory = Arc<dyn Fn(&[Message]) -> Arc<AgentDefinition> + Send + Sync>;

/// Decides the next stage from a stage's aggregated output: `Some(name)` to
/// continue to another (or the same) stage, `None` to succeed.
pub type NextFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One named stage of a pipeline.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub input_fn: Option<InputFn>,
    pub agent_factory: AgentFactory,
    pub next_fn: NextFn,
}

impl Stage {
    pub fn new(name: impl Into<String>, agent_factory: AgentFactory, next_fn: NextFn) -> Self {
        Self {
            name: name.into(),
            input_fn: None,
            agent_factory,
            next_fn,
        }
    }

    pub fn with_input_fn(mut self, input_fn: InputFn) -> Self {
        self.input_fn = Some(input_fn);
        self
    }
}

/// A named stage map plus the order its first stage is resolved from.
#[derive(Default, Clone)]
pub struct Pipeline {
    stages: HashMap<String, Stage>,
    order: Vec<String>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.order.push(stage.name.clone());
        self.stages.insert(stage.name.clone(), stage);
        self
    }

    pub fn first_stage_name(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub enum PipelineError {
    UnknownStage(String),
    StageRetryBudgetExceeded { stage: String, max: u32 },
    TotalRetryBudgetExceeded(u32),
    StageProducedNoOutput(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::UnknownStage(name) => write!(f, "pipeline stage not found: {name}"),
            PipelineError::StageRetryBudgetExceeded { stage, max } => write!(
                f,
                "stage '{stage}' exceeded its per-stage retry budget ({max})"
            ),
            PipelineError::TotalRetryBudgetExceeded(max) => {
                write!(f, "pipeline exceeded its total retry budget ({max})")
            }
            PipelineError::StageProducedNoOutput(stage) => {
                write!(f, "stage '{stage}' produced no assistant output")
            }
        }
    }
}

impl Error for PipelineError {}

/// Result of a completed `runSequential` call.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub outputs: HashMap<String, String>,
    pub stage_invocations: HashMap<String, u32>,
    pub total_invocations: u32,
}

/// Executes a [`Pipeline`] stage-by-stage through an [`AgentRuntime`],
/// enforcing per-stage and total retry budgets.
pub struct PipelineRunner {
    runtime: Arc<AgentRuntime>,
}

impl PipelineRunner {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    /// `runSequential(pipeline, input, maxRetriesPerStage, maxTotalRetries)`.
    ///
    /// A stage's `next_fn` returning its own name counts as a retry of that
    /// stage; returning any other stage name resets that stage's retry
    /// counter for its next visit but still counts toward the global total.
    pub async fn run_sequential(
        &self,
        pipeline: &Pipeline,
        input: &str,
        max_retries_per_stage: u32,
        max_total_retries: u32,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut history = vec![Message::text(Role::User, input)];
        let mut last_output: HashMap<String, String> = HashMap::new();
        let mut stage_retries: HashMap<String, u32> = HashMap::new();
        let mut stage_invocations: HashMap<String, u32> = HashMap::new();
        let mut total_retries: u32 = 0;
        let mut total_invocations: u32 = 0;

        let mut current = pipeline
            .first_stage_name()
            .ok_or_else(|| PipelineError::UnknownStage("<empty pipeline>".into()))?
            .to_string();

        loop {
            let stage = pipeline
                .stages
                .get(&current)
                .ok_or_else(|| PipelineError::UnknownStage(current.clone()))?;

            log::info!("pipeline: running stage '{}'", stage.name);

            let effective_history = match &stage.input_fn {
                Some(input_fn) => input_fn(&history, &last_output),
                None => history.clone(),
            };
            let agent = (stage.agent_factory)(&effective_history);

            let output = self.run_stage(&agent, &effective_history).await?;
            if output.is_empty() {
                return Err(PipelineError::StageProducedNoOutput(stage.name.clone()));
            }

            *stage_invocations.entry(stage.name.clone()).or_insert(0) += 1;
            total_invocations += 1;
            last_output.insert(stage.name.clone(), output.clone());
            history.push(Message::text(Role::Assistant, output.clone()));

            match (stage.next_fn)(&output) {
                None => {
                    log::info!("pipeline: stage '{}' concluded the pipeline", stage.name);
                    return Ok(PipelineOutcome {
                        outputs: last_output,
                        stage_invocations,
                        total_invocations,
                    });
                }
                Some(next) if next == stage.name => {
                    let retries = stage_retries.entry(stage.name.clone()).or_insert(0);
                    *retries += 1;
                    total_retries += 1;
                    if *retries > max_retries_per_stage {
                        return Err(PipelineError::StageRetryBudgetExceeded {
                            stage: stage.name.clone(),
                            max: max_retries_per_stage,
                        });
                    }
                    if total_retries > max_total_retries {
                        return Err(PipelineError::TotalRetryBudgetExceeded(max_total_retries));
                    }
                    current = next;
                }
                Some(next) => {
                    current = next;
                }
            }
        }
    }

    /// Drives one stage's agent to completion and returns its final
    /// aggregated assistant text, discarding intermediate streaming events.
    async fn run_stage(
        &self,
        agent: &Arc<AgentDefinition>,
        history: &[Message],
    ) -> Result<String, PipelineError> {
        let mut rx = self.runtime.run_streamed(agent.clone(), None, history.to_vec());
        let mut aggregated = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamingEvent::MessageComplete { content, .. } => aggregated = content,
                StreamingEvent::Error { message, .. } => {
                    log::warn!("pipeline: stage '{}' ended with an error: {message}", agent.name);
                }
                _ => {}
            }
        }
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostTracker;
    use crate::provider::ProviderError;
    use crate::runtime::ModelCatalog;
    use crate::tool::ToolRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    /// Returns a fixed reply for every stage, counting invocations so tests
    /// can assert retry/budget behavior precisely.
    struct ScriptedProvider {
        replies: Vec<&'static str>,
        call_count: AtomicU32,
    }

    #[async_trait]
    impl crate::provider::ModelProvider for ScriptedProvider {
        async fn create_response_stream(
            &self,
            _model: &str,
            _messages: &[Message],
            _agent: &AgentDefinition,
        ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
            let index = self.call_count.fetch_add(1, Ordering::SeqCst) as usize;
            let reply = self.replies.get(index).copied().unwrap_or("done");
            let (tx, rx) = mpsc::channel(4);
            let reply = reply.to_string();
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamingEvent::MessageComplete {
                        message_id: "m".into(),
                        order: 0,
                        content: reply,
                        agent: None,
                    })
                    .await;
            });
            Ok(rx)
        }
    }

    fn test_runner(replies: Vec<&'static str>) -> PipelineRunner {
        let provider = Arc::new(ScriptedProvider {
            replies,
            call_count: AtomicU32::new(0),
        });
        let runtime = Arc::new(AgentRuntime::new(
            provider,
            Arc::new(ToolRegistry::new()),
            Arc::new(CostTracker::new()),
            Arc::new(ModelCatalog::new()),
        ));
        PipelineRunner::new(runtime)
    }

    fn plain_agent_factory(name: &'static str) -> AgentFactory {
        Arc::new(move |_history| Arc::new(AgentDefinition::new(name, name)))
    }

    #[tokio::test]
    async fn single_stage_pipeline_succeeds_when_next_fn_returns_none() {
        let runner = test_runner(vec!["final answer"]);
        let pipeline = Pipeline::new().with_stage(Stage::new(
            "only",
            plain_agent_factory("only"),
            Arc::new(|_output| None),
        ));

        let outcome = runner.run_sequential(&pipeline, "go", 2, 5).await.unwrap();
        assert_eq!(outcome.outputs.get("only").unwrap(), "final answer");
        assert_eq!(outcome.total_invocations, 1);
    }

    #[tokio::test]
    async fn plan_exec_validate_loopback_runs_expected_invocation_counts() {
        // validate returns "planning" three times then succeeds, matching
        // the documented loopback scenario.
        let mut validate_calls = 0u32;
        let runner = test_runner(vec![
            "plan1", "exec1", "retry", "plan2", "exec2", "retry", "plan3", "exec3", "retry",
            "plan4", "exec4", "ok",
        ]);

        let pipeline = Pipeline::new()
            .with_stage(Stage::new(
                "planning",
                plain_agent_factory("planner"),
                Arc::new(|_output| Some("exec".to_string())),
            ))
            .with_stage(Stage::new(
                "exec",
                plain_agent_factory("executor"),
                Arc::new(|_output| Some("validate".to_string())),
            ))
            .with_stage(Stage::new(
                "validate",
                plain_agent_factory("validator"),
                Arc::new(move |output| {
                    validate_calls += 1;
                    if output == "ok" {
                        None
                    } else {
                        Some("planning".to_string())
                    }
                }),
            ));

        let outcome = runner.run_sequential(&pipeline, "build a feature", 3, 9).await.unwrap();
        assert_eq!(outcome.stage_invocations["planning"], 4);
        assert_eq!(outcome.stage_invocations["exec"], 4);
        assert_eq!(outcome.stage_invocations["validate"], 4);
        assert_eq!(outcome.total_invocations, 12);
    }

    #[tokio::test]
    async fn exceeding_per_stage_retry_budget_is_terminal() {
        let runner = test_runner(vec!["retry", "retry", "retry", "retry"]);
        let pipeline = Pipeline::new().with_stage(Stage::new(
            "looper",
            plain_agent_factory("looper"),
            Arc::new(|_output| Some("looper".to_string())),
        ));

        let err = runner.run_sequential(&pipeline, "go", 2, 100).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageRetryBudgetExceeded { stage, max } if stage == "looper" && max == 2
        ));
    }

    #[tokio::test]
    async fn unknown_next_stage_name_is_reported_immediately() {
        let runner = test_runner(vec!["go to nowhere"]);
        let pipeline = Pipeline::new().with_stage(Stage::new(
            "only",
            plain_agent_factory("only"),
            Arc::new(|_output| Some("does_not_exist".to_string())),
        ));

        let err = runner.run_sequential(&pipeline, "go", 2, 5).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStage(name) if name == "does_not_exist"));
    }
}
