//! The single streaming event type produced by every producer in the
//! runtime (providers, the PTY engine, the tool dispatcher) and the
//! in-process bus that fans it out.
//!
//! Earlier iterations of this runtime carried three parallel event enums
//! (`AgentEvent`, `OrchestrationEvent`, `PlannerEvent`) with heavily
//! overlapping fields. They are collapsed here into one [`StreamingEvent`],
//! since every producer ultimately feeds the same current-turn consumer and
//! the same external sink.

use crate::message::AgentExport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Tagged variant of every event a stream can emit.
///
/// Invariant: for a given `message_id`, there is exactly one `*_start`
/// event, zero or more `*_delta` events with strictly increasing `order`,
/// and exactly one `*_complete` event — unless the stream is cut short by
/// an `Error` event, which may appear instead of the final `*_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamingEvent {
    MessageStart {
        message_id: String,
        order: u64,
        agent: Option<AgentExport>,
    },
    MessageDelta {
        message_id: String,
        order: u64,
        text: String,
        agent: Option<AgentExport>,
    },
    MessageComplete {
        message_id: String,
        order: u64,
        content: String,
        agent: Option<AgentExport>,
    },
    ThinkingDelta {
        message_id: String,
        order: u64,
        text: String,
        signature: Option<String>,
    },
    ToolStart {
        message_id: String,
        order: u64,
        call_id: String,
        name: String,
    },
    ToolDelta {
        message_id: String,
        order: u64,
        call_id: String,
        arguments_fragment: String,
    },
    ToolDone {
        message_id: String,
        order: u64,
        call_id: String,
        name: String,
        arguments: String,
    },
    FileDelta {
        message_id: String,
        order: u64,
        name: String,
        data: String,
    },
    CostUpdate {
        message_id: String,
        order: u64,
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    },
    Error {
        message_id: String,
        order: u64,
        message: String,
    },
    AgentStart {
        message_id: String,
        order: u64,
        agent: AgentExport,
    },
    AgentDone {
        message_id: String,
        order: u64,
        agent: AgentExport,
    },
    ProcessStart {
        message_id: String,
        order: u64,
    },
    ProcessRunning {
        message_id: String,
        order: u64,
        raw: String,
    },
    ProcessDone {
        message_id: String,
        order: u64,
        exit_code: i32,
    },
    ProcessFailed {
        message_id: String,
        order: u64,
        reason: String,
    },
    ProcessTerminated {
        message_id: String,
        order: u64,
    },
}

impl StreamingEvent {
    pub fn message_id(&self) -> &str {
        match self {
            StreamingEvent::MessageStart { message_id, .. }
            | StreamingEvent::MessageDelta { message_id, .. }
            | StreamingEvent::MessageComplete { message_id, .. }
            | StreamingEvent::ThinkingDelta { message_id, .. }
            | StreamingEvent::ToolStart { message_id, .. }
            | StreamingEvent::ToolDelta { message_id, .. }
            | StreamingEvent::ToolDone { message_id, .. }
            | StreamingEvent::FileDelta { message_id, .. }
            | StreamingEvent::CostUpdate { message_id, .. }
            | StreamingEvent::Error { message_id, .. }
            | StreamingEvent::AgentStart { message_id, .. }
            | StreamingEvent::AgentDone { message_id, .. }
            | StreamingEvent::ProcessStart { message_id, .. }
            | StreamingEvent::ProcessRunning { message_id, .. }
            | StreamingEvent::ProcessDone { message_id, .. }
            | StreamingEvent::ProcessFailed { message_id, .. }
            | StreamingEvent::ProcessTerminated { message_id, .. } => message_id,
        }
    }

    pub fn order(&self) -> u64 {
        match self {
            StreamingEvent::MessageStart { order, .. }
            | StreamingEvent::MessageDelta { order, .. }
            | StreamingEvent::MessageComplete { order, .. }
            | StreamingEvent::ThinkingDelta { order, .. }
            | StreamingEvent::ToolStart { order, .. }
            | StreamingEvent::ToolDelta { order, .. }
            | StreamingEvent::ToolDone { order, .. }
            | StreamingEvent::FileDelta { order, .. }
            | StreamingEvent::CostUpdate { order, .. }
            | StreamingEvent::Error { order, .. }
            | StreamingEvent::AgentStart { order, .. }
            | StreamingEvent::AgentDone { order, .. }
            | StreamingEvent::ProcessStart { order, .. }
            | StreamingEvent::ProcessRunning { order, .. }
            | StreamingEvent::ProcessDone { order, .. }
            | StreamingEvent::ProcessFailed { order, .. }
            | StreamingEvent::ProcessTerminated { order, .. } => *order,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamingEvent::MessageComplete { .. }
                | StreamingEvent::Error { .. }
                | StreamingEvent::ProcessDone { .. }
                | StreamingEvent::ProcessFailed { .. }
                | StreamingEvent::ProcessTerminated { .. }
        )
    }
}

/// Per-message_id monotonic order counter. One of these is owned by
/// whichever producer is assembling a given logical message (a provider
/// turn, a PTY run); it is not shared across message_ids.
#[derive(Debug, Default)]
pub struct OrderCounter(u64);

impl OrderCounter {
    pub fn new() -> Self {
        Self(0)
    }

    /// Returns the next order value and advances the counter.
    pub fn next(&mut self) -> u64 {
        let current = self.0;
        self.0 += 1;
        current
    }
}

/// External sink for events leaving the bus. A no-op default method so a
/// sink only overrides what it cares about.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, _event: &StreamingEvent) {}
}

/// An [`EventSink`] that does nothing. Used as the default external sink so
/// callers are never forced to supply one.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn on_event(&self, _event: &StreamingEvent) {}
}

/// In-process, ordered fan-out of events from a single producer task to a
/// single current-turn consumer channel and an optional external sink.
///
/// Per the coroutines-map-to-tasks-and-channels design note, this wraps a
/// bounded `tokio::sync::mpsc` channel rather than an ad-hoc async
/// generator: the producer task owns the `Sender` half and the consumer
/// (Agent Runtime turn, or a direct caller of the PTY/provider stream) owns
/// the `Receiver` half.
pub struct EventBus {
    sender: mpsc::Sender<StreamingEvent>,
    sink: Arc<dyn EventSink>,
}

/// Default channel capacity for an [`EventBus`]; large enough that a burst
/// of PTY deltas does not stall the producer on the 50ms batching cadence.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamingEvent>) {
        Self::with_sink(capacity, Arc::new(NullSink))
    }

    pub fn with_sink(
        capacity: usize,
        sink: Arc<dyn EventSink>,
    ) -> (Self, mpsc::Receiver<StreamingEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, sink }, receiver)
    }

    /// Forward `event` to the consumer channel and the external sink, in
    /// that order. Never blocks forever: the channel send only awaits
    /// backpressure, and a full channel is itself a natural cooperative-
    /// scheduling suspension point.
    pub async fn emit(&self, event: StreamingEvent) {
        self.sink.on_event(&event).await;
        // A dropped receiver (consumer cancelled) makes this a no-op rather
        // than an error: the producer's remaining work still gets to run to
        // a natural stopping point.
        let _ = self.sender.send(event).await;
    }

    /// Fire-and-forget variant for non-async call sites: spawns a task
    /// rather than block a synchronous caller.
    pub fn emit_sync(&self, event: StreamingEvent) {
        let sender = self.sender.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.on_event(&event).await;
            let _ = sender.send(event).await;
        });
    }
}
