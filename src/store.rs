//! Event store port
//!
//! The relational store is an external collaborator; the daemon only needs
//! `insert` and `list`. The in-memory adapter backs tests and standalone
//! runs without a database.

use async_trait::async_trait;
use tokio::sync::RwLock;

use fimtrack_core::error::Result;
use fimtrack_core::events::FileEvent;

/// Persistence interface for file events. Ownership of an event passes to
/// the store on insert.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: FileEvent) -> Result<()>;
    async fn list(&self) -> Result<Vec<FileEvent>>;
}

/// In-memory event store. Insert is an upsert: re-reporting the same event
/// is a no-op, so periodic full syncs don't accumulate duplicates.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<FileEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert(&self, event: FileEvent) -> Result<()> {
        let mut events = self.events.write().await;
        if !events.contains(&event) {
            events.push(event);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FileEvent>> {
        Ok(self.events.read().await.clone())
    }
}
