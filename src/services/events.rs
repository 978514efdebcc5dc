//! Pipeline notifications
//!
//! Events are emitted after commit and delivered over a broadcast channel.
//! Emission never fails the request: with no subscribers, or with a lagging
//! one, events are simply dropped. Every event names the tenant room it
//! belongs to so a fan-out layer can route it without touching the store.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::pipeline::EntityRef;

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by pipeline services
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    LeadCreated {
        tenant_id: Option<String>,
        lead_id: String,
        status: String,
    },
    LeadClaimed {
        tenant_id: Option<String>,
        lead_id: String,
        claimant_id: String,
    },
    StatusChanged {
        tenant_id: Option<String>,
        entity: EntityRef,
        from: String,
        to: String,
        actor_id: String,
    },
    ClosingCreated {
        tenant_id: Option<String>,
        closing_id: String,
        lead_id: String,
    },
    EvidenceUploaded {
        tenant_id: Option<String>,
        evidence_id: String,
        entity: EntityRef,
    },
    LeadDeleted {
        tenant_id: Option<String>,
        lead_id: String,
    },
}

impl PipelineEvent {
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::LeadCreated { tenant_id, .. }
            | PipelineEvent::LeadClaimed { tenant_id, .. }
            | PipelineEvent::StatusChanged { tenant_id, .. }
            | PipelineEvent::ClosingCreated { tenant_id, .. }
            | PipelineEvent::EvidenceUploaded { tenant_id, .. }
            | PipelineEvent::LeadDeleted { tenant_id, .. } => tenant_id.as_deref(),
        }
    }

    /// Fan-out room: `tenant:<id>`, or `global` for untenanted rows
    pub fn room(&self) -> String {
        match self.tenant_id() {
            Some(tenant) => format!("tenant:{}", tenant),
            None => "global".to_string(),
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Event bus for broadcasting pipeline events
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: PipelineEvent) {
        trace!(event = ?event, room = %event.room(), "Emitting pipeline event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every event; stands in for the real-time fan-out
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &PipelineEvent) {
        let room = event.room();
        match event {
            PipelineEvent::LeadCreated { lead_id, status, .. } => {
                info!(room = %room, lead = %lead_id, status = %status, "Lead created");
            }
            PipelineEvent::LeadClaimed { lead_id, claimant_id, .. } => {
                info!(room = %room, lead = %lead_id, claimant = %claimant_id, "Lead claimed");
            }
            PipelineEvent::StatusChanged { entity, from, to, actor_id, .. } => {
                info!(
                    room = %room,
                    entity = %entity,
                    from = %from,
                    to = %to,
                    actor = %actor_id,
                    "Status changed"
                );
            }
            PipelineEvent::ClosingCreated { closing_id, lead_id, .. } => {
                info!(room = %room, closing = %closing_id, lead = %lead_id, "Closing created");
            }
            _ => {
                debug!(room = %room, event = ?event, "Pipeline event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(PipelineEvent::LeadClaimed {
            tenant_id: Some("t1".into()),
            lead_id: "L1".into(),
            claimant_id: "s1".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        assert_eq!(event.room(), "tenant:t1");
        match event {
            PipelineEvent::LeadClaimed { lead_id, claimant_id, .. } => {
                assert_eq!(lead_id, "L1");
                assert_eq!(claimant_id, "s1");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        bus.emit(PipelineEvent::LeadDeleted { tenant_id: None, lead_id: "L1".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_untenanted_room() {
        let event = PipelineEvent::LeadDeleted { tenant_id: None, lead_id: "L1".into() };
        assert_eq!(event.room(), "global");
    }
}
