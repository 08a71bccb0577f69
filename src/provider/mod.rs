//! The Model Provider abstraction: a uniform streaming interface plus the
//! three implementation kinds below (native HTTP, CLI-over-PTY, and
//! fallback-on-quota composition).

pub mod cli_pty;
pub mod fallback;
pub mod native;

use crate::agent_def::AgentDefinition;
use crate::event::StreamingEvent;
use crate::message::Message;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ProviderError {
    Transient(String),
    ContextOverflow(String),
    Fatal(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient(m) => write!(f, "transient provider error: {m}"),
            ProviderError::ContextOverflow(m) => write!(f, "context overflow: {m}"),
            ProviderError::Fatal(m) => write!(f, "fatal provider error: {m}"),
        }
    }
}

impl Error for ProviderError {}

/// `createResponseStream(model, messages, agent) -> lazy event sequence`.
///
/// Implementations must respect the per-`message_id` event ordering
/// invariants and report usage through the supplied
/// [`crate::cost::CostTracker`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn create_response_stream(
        &self,
        model: &str,
        messages: &[Message],
        agent: &AgentDefinition,
    ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError>;
}
