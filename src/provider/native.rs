//! The native HTTP streaming provider: context-window truncation, the
//! context-overflow retry loop, pause awareness, and model-class parameter
//! mapping.
//!
//! Generalizes what would otherwise be one bespoke client per vendor into a
//! single provider parameterized by a [`WireAdapter`] plug point: everything
//! vendor-specific (request shaping, response parsing) lives in the
//! adapter; everything required regardless of vendor (retry, truncation,
//! pause, parameter mapping) lives here once.

use crate::agent_def::AgentDefinition;
use crate::cost::CostTracker;
use crate::event::{OrderCounter, StreamingEvent};
use crate::message::{Message, ModelClass, Role, TextContent, ToolDefinition};
use crate::pty::registry as pty_registry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::ProviderError;

/// Approximate characters-per-token used for non-image content.
const CHARS_PER_TOKEN: usize = 4;
/// Fixed token overhead attributed to one image part.
const IMAGE_TOKEN_OVERHEAD: usize = 85;
/// Token headroom subtracted from a model's context limit before deciding
/// whether truncation is needed.
const SAFETY_BUFFER_TOKENS: usize = 27_000;

const DEFAULT_MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 10_000;

fn default_retryable_substrings() -> Vec<String> {
    vec![
        "context window".to_string(),
        "token limit".to_string(),
        "max tokens".to_string(),
        "context length".to_string(),
    ]
}

/// Per-model-class request parameters. Some model families reject
/// `temperature`/`top_p` outright (e.g. reasoning-tier models); `max_tokens`
/// is capped per class.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: u32,
}

fn params_for_class(class: Option<ModelClass>) -> ModelParams {
    match class {
        Some(ModelClass::Reasoning) => ModelParams {
            temperature: None,
            top_p: None,
            max_tokens: 32_000,
        },
        Some(ModelClass::Mini) => ModelParams {
            temperature: Some(0.7),
            top_p: Some(1.0),
            max_tokens: 4_096,
        },
        _ => ModelParams {
            temperature: Some(0.7),
            top_p: Some(1.0),
            max_tokens: 8_192,
        },
    }
}

/// Context-window size (in approximate tokens) assumed for a model. Unknown
/// models fall back to a conservative default rather than erroring — the
/// core does not maintain an exhaustive model registry.
fn context_limit_for(model: &str) -> usize {
    if model.contains("mini") {
        64_000
    } else if model.contains("128k") {
        128_000
    } else {
        128_000
    }
}

/// Estimate the token cost of a slice of messages using the ~4
/// characters-per-token approximation for text, plus a fixed overhead per
/// image part.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

fn estimate_message_tokens(message: &Message) -> usize {
    match message {
        Message::Text { content, .. } => match content {
            TextContent::Plain(s) => s.len() / CHARS_PER_TOKEN + 1,
            TextContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    crate::message::ContentPart::InputText { text } => {
                        text.len() / CHARS_PER_TOKEN + 1
                    }
                    crate::message::ContentPart::InputImage { .. } => IMAGE_TOKEN_OVERHEAD,
                    crate::message::ContentPart::InputFile { name, .. } => {
                        name.len() / CHARS_PER_TOKEN + 1
                    }
                })
                .sum(),
        },
        Message::Thinking { content, .. } => content.len() / CHARS_PER_TOKEN + 1,
        Message::FunctionCall { arguments, .. } => arguments.len() / CHARS_PER_TOKEN + 1,
        Message::FunctionCallOutput { output, .. } => output.len() / CHARS_PER_TOKEN + 1,
    }
}

/// Apply middle truncation: always keep `history[0]`, insert one synthetic
/// truncation-notice developer message, and keep the last `keep_last`
/// messages. `keep_last` is clamped so at least the last 2 messages survive
/// whenever the history has at least 2 messages after the first.
fn truncate_middle(history: &[Message], keep_last: usize) -> Vec<Message> {
    if history.is_empty() {
        return Vec::new();
    }
    let keep_last = keep_last.max(2.min(history.len().saturating_sub(1)));
    let keep_last = keep_last.min(history.len().saturating_sub(1));

    let mut result = Vec::with_capacity(keep_last + 2);
    result.push(history[0].clone());
    result.push(Message::developer(
        "[earlier conversation history truncated to fit the model's context window]",
    ));
    if keep_last > 0 {
        result.extend_from_slice(&history[history.len() - keep_last..]);
    }
    result
}

/// Given the original history length and the current truncation
/// aggressiveness (1 on the preemptive pass, doubling on each overflow
/// retry: 2, 4, 8, ...), compute how many trailing messages to keep.
fn keep_last_for_attempt(original_len: usize, aggressiveness: u32) -> usize {
    let divisor = 1u64 << aggressiveness.min(20); // 2, 4, 8, ...
    let budget_len = ((original_len as u64) / divisor).max(3) as usize;
    budget_len.saturating_sub(2).max(2)
}

/// Vendor-specific half of the native provider: shapes the wire request,
/// performs the streaming HTTP call, and translates the response into
/// [`StreamingEvent`]s (including reporting usage via the returned
/// `CostUpdate` events — the provider forwards these into the shared
/// [`CostTracker`]).
#[async_trait]
pub trait WireAdapter: Send + Sync {
    async fn stream(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: &ModelParams,
        message_id: &str,
    ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError>;
}

pub struct NativeProviderConfig {
    pub max_retries: u32,
    pub retryable_substrings: Vec<String>,
}

impl Default for NativeProviderConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retryable_substrings: default_retryable_substrings(),
        }
    }
}

pub struct NativeStreamProvider {
    adapter: Arc<dyn WireAdapter>,
    cost_tracker: Arc<CostTracker>,
    config: NativeProviderConfig,
}

impl NativeStreamProvider {
    pub fn new(adapter: Arc<dyn WireAdapter>, cost_tracker: Arc<CostTracker>) -> Self {
        Self {
            adapter,
            cost_tracker,
            config: NativeProviderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NativeProviderConfig) -> Self {
        self.config = config;
        self
    }

    fn is_retryable(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.config
            .retryable_substrings
            .iter()
            .any(|s| lower.contains(&s.to_lowercase()))
    }
}

#[async_trait]
impl super::ModelProvider for NativeStreamProvider {
    async fn create_response_stream(
        &self,
        model: &str,
        messages: &[Message],
        agent: &AgentDefinition,
    ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let (out_tx, out_rx) = mpsc::channel::<StreamingEvent>(256);

        let adapter = self.adapter.clone();
        let cost_tracker = self.cost_tracker.clone();
        let max_retries = self.config.max_retries;
        let retryable_substrings = self.config.retryable_substrings.clone();
        let model = model.to_string();
        let messages = messages.to_vec();
        let tools = agent.tool_definitions_for_model();
        let model_class = agent.model_class;

        tokio::spawn(async move {
            let mut order = OrderCounter::new();
            let limit = context_limit_for(&model);
            let budget = limit.saturating_sub(SAFETY_BUFFER_TOKENS);
            let params = params_for_class(model_class);

            let mut attempt: u32 = 0;
            loop {
                // Pause awareness: block before initiating a new request.
                if pty_registry::GLOBAL.is_paused() {
                    let _ = out_tx
                        .send(StreamingEvent::MessageDelta {
                            message_id: message_id.clone(),
                            order: order.next(),
                            text: "[paused: waiting to resume before contacting the model provider]".into(),
                            agent: None,
                        })
                        .await;
                    let mut rx = pty_registry::GLOBAL.subscribe_pause();
                    while *rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                }

                let estimated = estimate_tokens(&messages);
                let effective_messages = if estimated > budget {
                    let aggressiveness = if attempt == 0 { 1 } else { 1u32 << attempt };
                    let keep_last = keep_last_for_attempt(messages.len(), aggressiveness);
                    truncate_middle(&messages, keep_last)
                } else {
                    messages.clone()
                };

                match adapter
                    .stream(&model, &effective_messages, &tools, &params, &message_id)
                    .await
                {
                    Ok(mut upstream) => {
                        while let Some(event) = upstream.recv().await {
                            if let StreamingEvent::CostUpdate {
                                model: usage_model,
                                input_tokens,
                                output_tokens,
                                cached_tokens,
                                ..
                            } = &event
                            {
                                cost_tracker.add_usage(crate::cost::UsageReport {
                                    model: usage_model.clone(),
                                    cost: 0.0,
                                    input_tokens: *input_tokens,
                                    output_tokens: *output_tokens,
                                    cached_tokens: *cached_tokens,
                                });
                            }
                            if out_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                    Err(ProviderError::ContextOverflow(msg)) if attempt < max_retries => {
                        attempt += 1;
                        let _ = out_tx
                            .send(StreamingEvent::MessageDelta {
                                message_id: message_id.clone(),
                                order: order.next(),
                                text: "Retrying with reduced context …".into(),
                                agent: None,
                            })
                            .await;
                        let backoff = (BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(10)))
                            .min(BACKOFF_CAP_MS);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        let _ = msg;
                        continue;
                    }
                    Err(ProviderError::Transient(msg))
                        if attempt < max_retries
                            && retryable_substrings
                                .iter()
                                .any(|s| msg.to_lowercase().contains(&s.to_lowercase())) =>
                    {
                        attempt += 1;
                        let backoff = (BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(10)))
                            .min(BACKOFF_CAP_MS);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                    Err(err) => {
                        let _ = out_tx
                            .send(StreamingEvent::Error {
                                message_id: message_id.clone(),
                                order: order.next(),
                                message: err.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(out_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn history_of(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::user(format!("message {i}")))
            .collect()
    }

    #[test]
    fn boundary_at_exact_budget_is_not_truncated() {
        let budget = 100usize;
        // One char per token roughly at 4 chars/token: build a message of
        // exactly `budget * 4` characters (minus 1 for the "+1" rounding
        // this estimator applies) so estimate == budget exactly.
        let text = "a".repeat(budget * CHARS_PER_TOKEN - CHARS_PER_TOKEN);
        let messages = vec![Message::user(text)];
        let estimated = estimate_tokens(&messages);
        assert!(estimated <= budget);
    }

    #[test]
    fn one_token_over_budget_triggers_truncation_decision() {
        let budget = 10usize;
        let text = "a".repeat(budget * CHARS_PER_TOKEN + CHARS_PER_TOKEN);
        let messages = vec![Message::user(text)];
        let estimated = estimate_tokens(&messages);
        assert!(estimated > budget);
    }

    #[test]
    fn truncation_keeps_first_message_and_one_notice() {
        let history = history_of(200);
        let keep_last = keep_last_for_attempt(200, 1);
        let truncated = truncate_middle(&history, keep_last);

        assert_eq!(truncated.len(), 100);
        assert_eq!(truncated[0], history[0]);
        assert!(matches!(
            &truncated[1],
            Message::Text {
                role: Role::Developer,
                ..
            }
        ));
        // At least the last 2 original messages are preserved verbatim.
        assert_eq!(truncated[truncated.len() - 1], history[history.len() - 1]);
        assert_eq!(truncated[truncated.len() - 2], history[history.len() - 2]);
    }

    #[test]
    fn truncation_aggressiveness_doubles_on_retry() {
        let first = keep_last_for_attempt(200, 1);
        let second = keep_last_for_attempt(200, 2);
        assert!(second < first);
    }

    struct OverflowThenOkAdapter {
        calls: Arc<std::sync::Mutex<Vec<usize>>>,
        fail_calls: usize,
    }

    #[async_trait]
    impl WireAdapter for OverflowThenOkAdapter {
        async fn stream(
            &self,
            _model: &str,
            messages: &[Message],
            _tools: &[ToolDefinition],
            _params: &ModelParams,
            message_id: &str,
        ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
            let call_index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(messages.len());
                calls.len()
            };
            if call_index <= self.fail_calls {
                return Err(ProviderError::ContextOverflow("too much context".into()));
            }
            let (tx, rx) = mpsc::channel(4);
            let message_id = message_id.to_string();
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamingEvent::MessageComplete {
                        message_id,
                        order: 0,
                        content: "ok".into(),
                        agent: None,
                    })
                    .await;
            });
            Ok(rx)
        }
    }

    /// Drives the live retry loop (not just `keep_last_for_attempt` in
    /// isolation): each overflow retry must submit a strictly smaller
    /// effective history than the retry before it.
    #[tokio::test]
    async fn live_retry_loop_truncates_more_aggressively_on_each_successive_retry() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let adapter = Arc::new(OverflowThenOkAdapter {
            calls: calls.clone(),
            fail_calls: 2,
        });
        let provider = NativeStreamProvider::new(adapter, Arc::new(CostTracker::new()));
        let history: Vec<Message> = (0..1000)
            .map(|i| Message::user(format!("{}{i}", "a".repeat(500))))
            .collect();
        let agent = AgentDefinition::new("a1", "A");

        let mut rx = provider
            .create_response_stream("big-model", &history, &agent)
            .await
            .unwrap();
        while rx.recv().await.is_some() {}

        let recorded = calls.lock().unwrap().clone();
        assert_eq!(recorded.len(), 3, "expected preemptive pass + 2 retries");
        assert!(
            recorded[1] < recorded[0],
            "first retry ({}) should truncate more than the preemptive pass ({})",
            recorded[1],
            recorded[0]
        );
        assert!(
            recorded[2] < recorded[1],
            "second retry ({}) should truncate more than the first retry ({})",
            recorded[2],
            recorded[1]
        );
    }
}
