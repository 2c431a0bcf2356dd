//! Repository handles used by the pipeline

use courier_storage::{
    DatabasePool, DbDeliveryLedger, DbLiveStats, DbMessageStore, DbQueueStore, DbRouteStore,
    DbServerStore, DbSuppressionList, DeliveryLedger, FileStorage, LiveStats, MemoryStore,
    MessageStorage, MessageStore, QueueStore, RouteStore, ServerStore, SuppressionList,
};
use std::sync::Arc;

/// Every store the dequeue pipeline reads or writes
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn QueueStore>,
    pub messages: Arc<dyn MessageStore>,
    pub deliveries: Arc<dyn DeliveryLedger>,
    pub suppressions: Arc<dyn SuppressionList>,
    pub servers: Arc<dyn ServerStore>,
    pub routes: Arc<dyn RouteStore>,
    pub live_stats: Arc<dyn LiveStats>,
    pub raw: MessageStorage,
}

impl Stores {
    /// PostgreSQL backed stores with raw messages in `files`
    pub fn postgres(pool: DatabasePool, files: Arc<dyn FileStorage>, suppression_days: i64) -> Self {
        Self {
            queue: Arc::new(DbQueueStore::new(pool.clone())),
            messages: Arc::new(DbMessageStore::new(pool.clone())),
            deliveries: Arc::new(DbDeliveryLedger::new(pool.clone())),
            suppressions: Arc::new(DbSuppressionList::new(pool.clone(), suppression_days)),
            servers: Arc::new(DbServerStore::new(pool.clone())),
            routes: Arc::new(DbRouteStore::new(pool.clone())),
            live_stats: Arc::new(DbLiveStats::new(pool)),
            raw: MessageStorage::new(files),
        }
    }

    /// All stores backed by one in-memory store
    pub fn from_memory(store: &MemoryStore) -> Self {
        Self {
            queue: Arc::new(store.clone()),
            messages: Arc::new(store.clone()),
            deliveries: Arc::new(store.clone()),
            suppressions: Arc::new(store.clone()),
            servers: Arc::new(store.clone()),
            routes: Arc::new(store.clone()),
            live_stats: Arc::new(store.clone()),
            raw: MessageStorage::new(Arc::new(store.clone())),
        }
    }
}
