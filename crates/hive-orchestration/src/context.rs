//! Orchestration context for runtime-agnostic service management
//!
//! Carries the shared collaborators every orchestration component needs:
//! the async spawner, the capability registry, the routing table and the
//! event collector.

use crate::{
    capabilities::CapabilityRegistry, config::OrchestratorSettings,
    observability::EventCollector, proxy::RoutingTable,
};
use hive_runtime::{BoxTask, Spawner};
use std::sync::Arc;

/// Context object for service orchestration
#[derive(Clone)]
pub struct OrchestrationContext {
    /// Runtime spawner for background work
    pub spawner: Arc<dyn Spawner>,

    /// Capability implementations
    pub registry: Arc<CapabilityRegistry>,

    /// Live service targets, read by the request path
    pub routing: Arc<RoutingTable>,

    /// Fan-out to observability sinks
    pub events: Arc<EventCollector>,

    /// Orchestrator-wide settings
    pub settings: OrchestratorSettings,
}

impl OrchestrationContext {
    /// Create a context, starting one event worker per registered sink
    pub fn new(
        registry: CapabilityRegistry,
        settings: OrchestratorSettings,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        let events = EventCollector::new(registry.sinks(), settings.sink_queue_capacity, &spawner);
        Self {
            spawner,
            registry: Arc::new(registry),
            routing: Arc::new(RoutingTable::new()),
            events: Arc::new(events),
            settings,
        }
    }

    /// Spawn a future in the background
    pub fn spawn(&self, future: BoxTask) {
        self.spawner.spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{MemorySink, ObservabilityEvent};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[smol_potat::test]
    async fn test_context_wires_sinks() {
        let sink = Arc::new(MemorySink::new(16));
        let registry = CapabilityRegistry::builder().sink("memory", sink.clone()).build();
        let ctx = OrchestrationContext::new(
            registry,
            OrchestratorSettings::default(),
            hive_runtime::default_spawner(),
        );

        ctx.events.emit(ObservabilityEvent::warning("api", "drift"));
        ctx.events.flush().await.unwrap();

        assert_eq!(sink.warnings().len(), 1);
        assert!(ctx.routing.is_empty());
    }

    #[smol_potat::test]
    async fn test_context_spawning() {
        let ctx = OrchestrationContext::new(
            CapabilityRegistry::builder().build(),
            OrchestratorSettings::default(),
            hive_runtime::default_spawner(),
        );

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        ctx.spawn(Box::pin(async move {
            flag_clone.store(true, Ordering::SeqCst);
        }));

        smol::Timer::after(Duration::from_millis(20)).await;
        assert!(flag.load(Ordering::SeqCst));
    }
}
