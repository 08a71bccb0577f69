//! The fallback-on-quota meta-provider: wraps a primary
//! provider with a concurrency gate and defers to a secondary provider when
//! the gate is saturated, rather than queuing.
//!
//! A backpressure-driven degradation path rather than a queue, built on
//! `tokio::sync::Semaphore` — the idiomatic async admission-control
//! primitive already available from the existing `tokio(full)` dependency.

use crate::agent_def::AgentDefinition;
use crate::event::StreamingEvent;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{ModelProvider, ProviderError};

/// A primary provider guarded by a fixed number of concurrency slots, with
/// a secondary provider absorbing requests once the primary is saturated.
pub struct FallbackProvider {
    primary: Arc<dyn ModelProvider>,
    secondary: Arc<dyn ModelProvider>,
    slots: Arc<Semaphore>,
}

impl FallbackProvider {
    pub fn new(primary: Arc<dyn ModelProvider>, secondary: Arc<dyn ModelProvider>, capacity: usize) -> Self {
        Self {
            primary,
            secondary,
            slots: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Non-blocking admission check: `Some(permit)` if the primary has
    /// spare capacity right now, `None` if it's saturated. Never awaits —
    /// saturation degrades immediately to the secondary provider instead of
    /// queuing.
    fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }
}

#[async_trait]
impl ModelProvider for FallbackProvider {
    async fn create_response_stream(
        &self,
        model: &str,
        messages: &[Message],
        agent: &AgentDefinition,
    ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
        match self.try_acquire_slot() {
            Some(permit) => {
                let result = self.primary.create_response_stream(model, messages, agent).await;
                match result {
                    Ok(rx) => {
                        // The permit is released once the primary's stream
                        // is fully drained (success or error), not merely
                        // once the call returns — the slot represents a
                        // live in-flight CLI process/connection, not just
                        // the request's enqueue step.
                        Ok(release_permit_when_drained(rx, permit))
                    }
                    Err(err) => {
                        drop(permit);
                        Err(err)
                    }
                }
            }
            None => self.secondary.create_response_stream(model, messages, agent).await,
        }
    }
}

/// Wrap `rx` so the semaphore permit is held until the stream's last event
/// has been forwarded, then drop it, freeing the slot for the next caller.
fn release_permit_when_drained(
    mut rx: mpsc::Receiver<StreamingEvent>,
    permit: OwnedSemaphorePermit,
) -> mpsc::Receiver<StreamingEvent> {
    let (tx, forwarded_rx) = mpsc::channel(rx.max_capacity().max(1));
    tokio::spawn(async move {
        let _permit = permit;
        while let Some(event) = rx.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    forwarded_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_def::AgentDefinition;
    use tokio::sync::mpsc;

    struct StubProvider {
        label: &'static str,
    }

    #[async_trait]
    impl ModelProvider for StubProvider {
        async fn create_response_stream(
            &self,
            _model: &str,
            _messages: &[Message],
            _agent: &AgentDefinition,
        ) -> Result<mpsc::Receiver<StreamingEvent>, ProviderError> {
            let (tx, rx) = mpsc::channel(4);
            let label = self.label.to_string();
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamingEvent::MessageComplete {
                        message_id: "m1".into(),
                        order: 0,
                        content: label,
                        agent: None,
                    })
                    .await;
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn saturated_primary_defers_to_secondary() {
        let primary = Arc::new(StubProvider { label: "primary" });
        let secondary = Arc::new(StubProvider { label: "secondary" });
        let provider = FallbackProvider::new(primary, secondary, 1);
        let agent = AgentDefinition::new("a", "A");

        // Hold the single slot open manually to force saturation.
        let held_permit = provider.slots.clone().try_acquire_owned().unwrap();

        let mut rx = provider
            .create_response_stream("model", &[], &agent)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            StreamingEvent::MessageComplete { content, .. } => assert_eq!(content, "secondary"),
            other => panic!("unexpected event: {other:?}"),
        }
        drop(held_permit);
    }

    #[tokio::test]
    async fn available_primary_is_used_and_releases_its_slot_after_draining() {
        let primary = Arc::new(StubProvider { label: "primary" });
        let secondary = Arc::new(StubProvider { label: "secondary" });
        let provider = FallbackProvider::new(primary, secondary, 1);
        let agent = AgentDefinition::new("a", "A");

        let mut rx = provider
            .create_response_stream("model", &[], &agent)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            StreamingEvent::MessageComplete { content, .. } => assert_eq!(content, "primary"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(provider.slots.available_permits(), 1);
    }
}
