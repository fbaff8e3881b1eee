// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Engine Events
//
// Provides in-memory event streaming using tokio broadcast channels, with a
// pluggable notification gate consulted before fan-out. A gate veto is
// logged and the event dropped; the state transition that produced the
// event has already committed and is never rolled back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::{ResourceEvent, RunLifecycleEvent};
use crate::domain::run::RunId;

/// Unified engine event type for the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Run(RunLifecycleEvent),
    Resource(ResourceEvent),
}

impl EngineEvent {
    /// Stable wire name of the inner event.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Run(e) => e.kind(),
            EngineEvent::Resource(e) => e.kind(),
        }
    }
}

/// Verdict returned by a [`NotificationGate`] for one emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDecision {
    pub proceed: bool,
    pub reason: Option<String>,
}

impl NotificationDecision {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            reason: None,
        }
    }

    pub fn veto(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: Some(reason.into()),
        }
    }
}

/// External policy gate over event propagation.
///
/// The gate can veto fan-out but never the underlying state transition,
/// which has already committed by the time the gate runs.
#[async_trait]
pub trait NotificationGate: Send + Sync {
    async fn authorize(&self, event: &EngineEvent) -> NotificationDecision;
}

/// Default gate: everything propagates.
pub struct OpenGate;

#[async_trait]
impl NotificationGate for OpenGate {
    async fn authorize(&self, _event: &EngineEvent) -> NotificationDecision {
        NotificationDecision::proceed()
    }
}

/// Event bus for publishing and subscribing to engine events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EngineEvent>>,
    gate: Arc<dyn NotificationGate>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity.
    /// Capacity bounds how many events buffer before old ones drop.
    pub fn new(capacity: usize) -> Self {
        Self::with_gate(capacity, Arc::new(OpenGate))
    }

    pub fn with_gate(capacity: usize, gate: Arc<dyn NotificationGate>) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
            gate,
        }
    }

    pub async fn publish_run_event(&self, event: RunLifecycleEvent) {
        self.publish(EngineEvent::Run(event)).await;
    }

    pub async fn publish_resource_event(&self, event: ResourceEvent) {
        self.publish(EngineEvent::Resource(event)).await;
    }

    /// Publish an event to all subscribers, subject to the gate.
    async fn publish(&self, event: EngineEvent) {
        let decision = self.gate.authorize(&event).await;
        if !decision.proceed {
            warn!(
                kind = event.kind(),
                reason = decision.reason.as_deref().unwrap_or("unspecified"),
                "notification gate vetoed event propagation"
            );
            return;
        }

        debug!(kind = event.kind(), "publishing engine event");
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("no subscribers listening to event");
        }
    }

    /// Subscribe to all engine events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a single run's lifecycle events.
    pub fn subscribe_run(&self, run_id: RunId) -> RunEventReceiver {
        RunEventReceiver {
            receiver: self.sender.subscribe(),
            run_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver for all engine events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available).
    pub async fn recv(&mut self) -> Result<EngineEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Result<EngineEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single run's lifecycle events.
pub struct RunEventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
    run_id: RunId,
}

impl RunEventReceiver {
    pub async fn recv(&mut self) -> Result<RunLifecycleEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if let EngineEvent::Run(run_event) = event {
                if self.matches(&run_event) {
                    return Ok(run_event);
                }
            }
        }
    }

    fn matches(&self, event: &RunLifecycleEvent) -> bool {
        let id = match event {
            RunLifecycleEvent::RunStarted { run_id, .. } => run_id,
            RunLifecycleEvent::RunPaused { run_id, .. } => run_id,
            RunLifecycleEvent::RunResumed { run_id, .. } => run_id,
            RunLifecycleEvent::RunCompleted { run_id, .. } => run_id,
            RunLifecycleEvent::RunFailed { run_id, .. } => run_id,
            RunLifecycleEvent::RunCancelled { run_id, .. } => run_id,
            RunLifecycleEvent::CheckpointTaken { run_id, .. } => run_id,
        };
        *id == self.run_id
    }
}

/// Errors that can occur when receiving events.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,

    #[error("no events available")]
    Empty,

    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::SwarmId;
    use chrono::Utc;

    fn started(run_id: RunId) -> RunLifecycleEvent {
        RunLifecycleEvent::RunStarted {
            run_id,
            swarm_id: SwarmId::new(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();
        let run_id = RunId::new();

        bus.publish_run_event(started(run_id)).await;

        match receiver.recv().await.unwrap() {
            EngineEvent::Run(RunLifecycleEvent::RunStarted { run_id: id, .. }) => {
                assert_eq!(id, run_id);
            }
            other => panic!("wrong event received: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_filtering() {
        let bus = EventBus::new(10);
        let ours = RunId::new();
        let theirs = RunId::new();
        let mut receiver = bus.subscribe_run(ours);

        bus.publish_run_event(started(theirs)).await;
        bus.publish_run_event(started(ours)).await;

        match receiver.recv().await.unwrap() {
            RunLifecycleEvent::RunStarted { run_id, .. } => assert_eq!(run_id, ours),
            other => panic!("wrong event received: {other:?}"),
        }
    }

    struct DenyResources;

    #[async_trait]
    impl NotificationGate for DenyResources {
        async fn authorize(&self, event: &EngineEvent) -> NotificationDecision {
            if matches!(event, EngineEvent::Resource(_)) {
                NotificationDecision::veto("resource events suppressed")
            } else {
                NotificationDecision::proceed()
            }
        }
    }

    #[tokio::test]
    async fn test_gate_veto_drops_event_only() {
        let bus = EventBus::with_gate(10, Arc::new(DenyResources));
        let mut receiver = bus.subscribe();

        bus.publish_resource_event(ResourceEvent::ResourceExhausted {
            swarm_id: SwarmId::new(),
            resource: crate::domain::resources::ResourceKind::Credits,
            requested: 10,
            available: 5,
            observed_at: Utc::now(),
        })
        .await;
        let run_id = RunId::new();
        bus.publish_run_event(started(run_id)).await;

        // The vetoed resource event never arrives; the run event does.
        match receiver.recv().await.unwrap() {
            EngineEvent::Run(RunLifecycleEvent::RunStarted { run_id: id, .. }) => {
                assert_eq!(id, run_id)
            }
            other => panic!("wrong event received: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish_run_event(started(RunId::new())).await;
        a.recv().await.unwrap();
        b.recv().await.unwrap();
    }
}
