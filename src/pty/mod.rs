//! The general-purpose interactive-subprocess driver: spawns a command
//! attached to a pseudo-terminal and projects its output into an ordered,
//! deduplicated, batched [`crate::event::StreamingEvent`] sequence.
//!
//! Built on `portable-pty` (cross-platform PTY allocation) and
//! `strip-ansi-escapes` (terminal escape-sequence removal during line
//! extraction) — see `DESIGN.md` for why this crate pairing was chosen.

mod dedup;
mod engine;
pub mod registry;

pub use dedup::DEFAULT_WINDOW_SIZE;
pub use registry::{PtyControlHandle, PtyRegistry};

use crate::event::StreamingEvent;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A `(chars_threshold, timeout_ms)` tier. Tiers are consulted by linear
/// search, highest threshold first; the first tier whose threshold the
/// current buffer length meets or exceeds wins.
pub type TierTable = Vec<(usize, u64)>;

/// Default tier table: `{10000->10, 2000->100, 100->2000, 0->4000}`.
pub fn default_tier_table() -> TierTable {
    vec![(10_000, 10), (2_000, 100), (100, 2_000), (0, 4_000)]
}

pub type LinePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type LineHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Default silence watchdog timeout.
pub const DEFAULT_SILENCE_TIMEOUT_MS: u64 = 5_000;

/// Configuration for one [`run_pty`] invocation.
pub struct PtyOptions {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub silence_timeout_ms: u64,
    pub tier_table: TierTable,
    pub is_noise: Option<LinePredicate>,
    pub is_ready: Option<LinePredicate>,
    pub is_start: Option<LinePredicate>,
    pub line_hook: Option<LineHook>,
    pub initial_prompt: Option<String>,
    pub prompt_separator_sentinel: String,
    pub exit_command: String,
    pub success_exit_codes: Vec<i32>,
    pub message_id: Option<String>,
    pub newline: String,
    pub dedup_window_size: usize,
    /// Silence leniency for long-running commands is an explicit grace
    /// window plus a caller-supplied predicate for which commands qualify,
    /// rather than a hard-coded special case.
    pub silence_grace_ms: Option<u64>,
    pub long_running_predicate: Option<LinePredicate>,
}

impl PtyOptions {
    pub fn new(command: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd,
            env: HashMap::new(),
            cols: 80,
            rows: 60,
            silence_timeout_ms: DEFAULT_SILENCE_TIMEOUT_MS,
            tier_table: default_tier_table(),
            is_noise: None,
            is_ready: None,
            is_start: None,
            line_hook: None,
            initial_prompt: None,
            prompt_separator_sentinel: "-- ready --".to_string(),
            exit_command: "/exit".to_string(),
            success_exit_codes: vec![0, 1],
            message_id: None,
            newline: "\r\n".to_string(),
            dedup_window_size: DEFAULT_WINDOW_SIZE,
            silence_grace_ms: None,
            long_running_predicate: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_silence_timeout_ms(mut self, ms: u64) -> Self {
        self.silence_timeout_ms = ms;
        self
    }

    pub fn with_tier_table(mut self, tiers: TierTable) -> Self {
        self.tier_table = tiers;
        self
    }

    pub fn with_is_ready(mut self, predicate: LinePredicate) -> Self {
        self.is_ready = Some(predicate);
        self
    }

    pub fn with_is_start(mut self, predicate: LinePredicate) -> Self {
        self.is_start = Some(predicate);
        self
    }

    pub fn with_is_noise(mut self, predicate: LinePredicate) -> Self {
        self.is_noise = Some(predicate);
        self
    }

    pub fn with_line_hook(mut self, hook: LineHook) -> Self {
        self.line_hook = Some(hook);
        self
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_exit_command(mut self, command: impl Into<String>) -> Self {
        self.exit_command = command.into();
        self
    }

    pub fn with_prompt_separator_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.prompt_separator_sentinel = sentinel.into();
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_silence_grace(mut self, grace_ms: u64, predicate: LinePredicate) -> Self {
        self.silence_grace_ms = Some(grace_ms);
        self.long_running_predicate = Some(predicate);
        self
    }
}

#[derive(Debug, Clone)]
pub enum PtyError {
    Spawn(String),
    Io(String),
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtyError::Spawn(msg) => write!(f, "failed to spawn pty subprocess: {msg}"),
            PtyError::Io(msg) => write!(f, "pty io error: {msg}"),
        }
    }
}

impl Error for PtyError {}

/// External control surface for one running PTY instance.
pub struct PtyHandle {
    pub message_id: String,
    control: PtyControlHandle,
}

impl PtyHandle {
    pub async fn write(&self, data: &str) {
        self.control.write(data.as_bytes()).await;
    }

    pub async fn kill(&self) {
        self.control.kill().await;
    }

    /// Pause/resume is globally scoped across every PTY owned by the
    /// process, not a per-instance operation.
    pub fn pause_all() {
        registry::GLOBAL.pause();
    }

    pub fn resume_all() {
        registry::GLOBAL.resume();
    }
}

/// Spawn `options.command` attached to a pseudo-terminal and begin driving
/// it. Returns a control handle and the event receiver half of the
/// produced stream; the engine itself runs as a detached `tokio::task`.
pub fn run_pty(options: PtyOptions) -> Result<(PtyHandle, mpsc::Receiver<StreamingEvent>), PtyError> {
    engine::spawn(options)
}
