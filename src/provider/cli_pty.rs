//! The CLI-over-PTY model provider: wraps an
//! interactive CLI tool via [`crate::pty`], prompts it once per turn, and
//! parses its final structured summary (cost, durations, per-model token
//! counts) out of the accumulated terminal output.
//!
//! Generalizes the usual spawn/capture/translate-into-a-typed-result
//! subprocess idiom from a one-shot command into a long-lived, prompted
//! session built on [`crate::pty::run_pty`].

use crate::agent_def::AgentDefinition;
use crate::cost::{CostTracker, UsageReport};
use crate::event::{OrderCounter, StreamingEvent};
use crate::message::Message;
use crate::pty::{self, PtyOptions, TierTable};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::ProviderError;

/// Per-model $/1k-token pricing, used for the pricing-registry cost tier.
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Known model prices. Unknown models fall through to the linear-estimate
/// cost tier rather than erroring — pricing data is inherently incomplete
/// and the core does not own it.
#[derive(Default, Clone)]
pub struct ModelPricingRegistry {
    prices: HashMap<String, ModelPrice>,
}

impl ModelPricingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, model: impl Into<String>, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.prices.insert(model.into(), ModelPrice { input_per_1k, output_per_1k });
        self
    }

    pub fn price_for(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model).copied()
    }
}

/// $/token used by cost tier 3 (fallback linear estimate) when neither an
/// explicit cost line nor a pricing-registry entry is available.
const FALLBACK_COST_PER_TOKEN: f64 = 0.00001;

/// Configuration for one [`CliPtyProvider`].
pub struct CliPtyProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub prompt_separator_sentinel: String,
    pub exit_command: String,
    pub silence_timeout_ms: u64,
    pub tier_table: TierTable,
    pub pricing: ModelPricingRegistry,
}

impl CliPtyProviderConfig {
    pub fn new(command: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd,
            env: HashMap::new(),
            prompt_separator_sentinel: "-- ready --".to_string(),
            exit_command: "/exit".to_string(),
            silence_timeout_ms: pty::DEFAULT_SILENCE_TIMEOUT_MS,
            tier_table: pty::default_tier_table(),
            pricing: ModelPricingRegistry::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricingRegistry) -> Self {
        self.pricing = pricing;
        self
    }
}

/// Concatenate the text content of `messages`, one per line, separated by a
/// blank line.
fn build_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .map(Message::as_flat_text)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Clone, Default)]
struct ParsedSummary {
    explicit_cost: Option<f64>,
    api_duration_ms: Option<u64>,
    wall_duration_ms: Option<u64>,
    per_model_tokens: HashMap<String, (u64, u64)>,
}

fn duration_to_ms(value: f64, unit: &str) -> u64 {
    if unit.eq_ignore_ascii_case("s") {
        (value * 1000.0) as u64
    } else {
        value as u64
    }
}

/// Parse the CLI's final summary lines out of the accumulated clean output.
/// A malformed or absent summary degrades to an all-`None`/empty result
/// rather than an error.
fn parse_summary(output: &str) -> ParsedSummary {
    let mut summary = ParsedSummary::default();

    let cost_re = Regex::new(r"(?i)total cost:?\s*\$([0-9]+(?:\.[0-9]+)?)").unwrap();
    if let Some(caps) = cost_re.captures(output) {
        summary.explicit_cost = caps.get(1).and_then(|m| m.as_str().parse().ok());
    }

    let api_re = Regex::new(r"(?i)api duration:?\s*([0-9]+(?:\.[0-9]+)?)\s*(ms|s)").unwrap();
    if let Some(caps) = api_re.captures(output) {
        let value: f64 = caps[1].parse().unwrap_or(0.0);
        summary.api_duration_ms = Some(duration_to_ms(value, &caps[2]));
    }

    let wall_re = Regex::new(r"(?i)wall[- ]?duration:?\s*([0-9]+(?:\.[0-9]+)?)\s*(ms|s)").unwrap();
    if let Some(caps) = wall_re.captures(output) {
        let value: f64 = caps[1].parse().unwrap_or(0.0);
        summary.wall_duration_ms = Some(duration_to_ms(value, &caps[2]));
    }

    let model_re =
        Regex::new(r"(?im)^\s*model\s+([\w.\-/]+):\s*([0-9]+)\s*input tokens,\s*([0-9]+)\s*output tokens").unwrap();
    for caps in model_re.captures_iter(output) {
        let model = caps[1].to_string();
        let input: u64 = caps[2].parse().unwrap_or(0);
        let output: u64 = caps[3].parse().unwrap_or(0);
        summary.per_model_tokens.insert(model, (input, output));
    }

    summary
}

/// Resolve the total cost for `model`'s turn using a three-tier policy:
/// explicit summary line, then pricing-registry computation, then a linear
/// fallback estimate.
fn resolve_cost(summary: &ParsedSummary, model: &str, pricing: &ModelPricingRegistry) -> (f64, u64, u64) {
    let (input_tokens, output_tokens) = summary
        .per_model_tokens
        .get(model)
        .copied()
        .unwrap_or_else(|| {
            summary
                .per_model_tokens
                .values()
                .copied()
                .fold((0, 0), |(ai, ao), (i, o)| (ai + i, ao + o))
        });

    if let Some(cost) = summary.explicit_cost {
        return (cost, input_tokens, output_tokens);
    }
    if let Some(price) = pricing.price_for(model) {
        let cost = (input_tokens as f64 / 1000.0) * price.input_per_1k
            + (output_tokens as f64 / 1000.0) * price.output_per_1k;
        return (cost, input_tokens, output_tokens);
    }
    let total = input_tokens + output_tokens;
    (total as f64 * FALLBACK_COST_PER_TOKEN, input_tokens, output_tokens)
}

pub struct CliPtyProvider {
    config: CliPtyProviderConfig,
    cost_tracker: Arc<CostTracker>,
}

impl CliPtyProvider {
    pub fn new(config: CliPtyProviderConfig, cost_tracker: Arc<CostTracker>) -> Self {
        Self { config, cost_tracker }
    }
}

#[async_trait]
impl super::ModelProvider for CliPtyProvider {
    async fn create_response_stream(
        &self,
        model: &str,
        messages: &[Message],
        _agent: &AgentDefinition,
    ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
        let prompt = build_prompt(messages);
        let message_id = format!("cli-{}", uuid::Uuid::new_v4());

        let accumulated = Arc::new(Mutex::new(String::new()));
        let cost_summary_seen = Arc::new(AtomicBool::new(false));
        let hook_accumulated = accumulated.clone();
        let hook_seen = cost_summary_seen.clone();
        let line_hook: pty::LineHook = Arc::new(move |line: &str| {
            let mut acc = hook_accumulated.lock().expect("cli provider output lock poisoned");
            acc.push_str(line);
            acc.push('\n');
            if line.to_lowercase().contains("total cost") && !hook_seen.swap(true, Ordering::SeqCst) {
                log::trace!(target: "magi_core::provider::cli_pty", "cost summary line observed");
            }
        });

        let options = PtyOptions::new(self.config.command.clone(), self.config.cwd.clone())
            .with_args(self.config.args.clone())
            .with_env(self.config.env.clone())
            .with_initial_prompt(prompt)
            .with_message_id(message_id.clone())
            .with_line_hook(line_hook)
            .with_exit_command(self.config.exit_command.clone())
            .with_silence_timeout_ms(self.config.silence_timeout_ms)
            .with_tier_table(self.config.tier_table.clone())
            .with_prompt_separator_sentinel(self.config.prompt_separator_sentinel.clone());

        let (_handle, mut pty_rx) = pty::run_pty(options).map_err(|e| ProviderError::Fatal(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel::<StreamingEvent>(64);
        let cost_tracker = self.cost_tracker.clone();
        let pricing = self.config.pricing.clone();
        let model = model.to_string();
        let out_message_id = message_id.clone();

        tokio::spawn(async move {
            let mut had_error = false;
            while let Some(event) = pty_rx.recv().await {
                if matches!(event, StreamingEvent::Error { .. }) {
                    had_error = true;
                }
                if out_tx.send(event).await.is_err() {
                    return;
                }
            }
            if had_error {
                return;
            }

            let content = accumulated
                .lock()
                .expect("cli provider output lock poisoned")
                .clone();
            let summary = parse_summary(&content);
            let (cost, input_tokens, output_tokens) = resolve_cost(&summary, &model, &pricing);

            cost_tracker.add_usage(UsageReport {
                model: model.clone(),
                cost,
                input_tokens,
                output_tokens,
                cached_tokens: 0,
            });

            let mut order = OrderCounter::new();
            let _ = out_tx
                .send(StreamingEvent::CostUpdate {
                    message_id: out_message_id.clone(),
                    order: order.next(),
                    model: model.clone(),
                    input_tokens,
                    output_tokens,
                    cached_tokens: 0,
                })
                .await;
            let _ = out_tx
                .send(StreamingEvent::MessageComplete {
                    message_id: out_message_id,
                    order: order.next(),
                    content,
                    agent: None,
                })
                .await;
        });

        Ok(out_rx)
    }
}
