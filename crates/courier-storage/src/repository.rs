//! Repository layer for data access

pub mod deliveries;
pub mod live_stats;
pub mod messages;
pub mod queued_messages;
pub mod routes;
pub mod servers;
pub mod suppressions;

// Re-export concrete repository implementations
pub use deliveries::DbDeliveryLedger;
pub use live_stats::DbLiveStats;
pub use messages::DbMessageStore;
pub use queued_messages::DbQueueStore;
pub use routes::DbRouteStore;
pub use servers::DbServerStore;
pub use suppressions::DbSuppressionList;

// Re-export repository traits
pub use deliveries::DeliveryLedger;
pub use live_stats::LiveStats;
pub use messages::MessageStore;
pub use queued_messages::QueueStore;
pub use routes::RouteStore;
pub use servers::ServerStore;
pub use suppressions::SuppressionList;

/// Random token used in message headers and queue tokens
pub fn generate_token() -> String {
    let mut token = uuid::Uuid::new_v4().simple().to_string();
    token.truncate(16);
    token
}
