//! Typed event channel between the engines and the dispatcher.
//!
//! Engines push [`EngineEvent`]s onto a single unbounded FIFO channel; the
//! application root pumps it into the webhook dispatcher and the
//! scheduler's event triggers. One channel per process gives per-source
//! ordering for free; cross-source ordering is not promised.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use dataforge_core::lineage::LineageGraph;
use dataforge_core::models::EngineEvent;
use dataforge_store::{CoreStore, StoreRouter};

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Shared plumbing handed to every engine by the application root.
#[derive(Clone)]
pub struct EngineContext {
    pub core: Arc<CoreStore>,
    pub router: Arc<StoreRouter>,
    pub lineage: Arc<RwLock<LineageGraph>>,
    events: EventSender,
}

impl EngineContext {
    pub fn new(
        core: Arc<CoreStore>,
        router: Arc<StoreRouter>,
        lineage: Arc<RwLock<LineageGraph>>,
        events: EventSender,
    ) -> Self {
        EngineContext {
            core,
            router,
            lineage,
            events,
        }
    }

    /// Emit an event. Emission never fails the emitting operation: when the
    /// receiver is gone (shutdown), the event is dropped with a debug log.
    pub fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("event channel closed; dropping event");
        }
    }

    /// Mutate the lineage graph under the writer lock.
    pub fn with_lineage<T>(&self, f: impl FnOnce(&mut LineageGraph) -> T) -> T {
        let mut graph = self
            .lineage
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut graph)
    }

    /// Read the lineage graph under the reader lock.
    pub fn read_lineage<T>(&self, f: impl FnOnce(&LineageGraph) -> T) -> T {
        let graph = self
            .lineage
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&graph)
    }
}
