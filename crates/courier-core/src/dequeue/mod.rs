//! Message dequeuer
//!
//! A dequeue run takes one queued message, leases it along with any ready
//! siblings that share its batch key, and pushes each of them through the
//! single-message pipeline. Every message leaves a run either removed from
//! the queue with a terminal delivery, or rescheduled with its lease
//! released. Nothing a message does can stop the rest of its batch.

#[macro_use]
pub mod outcome;
mod incoming;
mod outgoing;
mod single;
pub mod state;

pub use outcome::Outcome;
pub use state::DequeueState;

use crate::bounce::BounceMessage;
use crate::inspection::MessageInspector;
use crate::metrics::Metrics;
use crate::sender::SenderFactory;
use crate::stores::Stores;
use chrono::Utc;
use courier_common::config::DeliveryConfig;
use courier_common::types::{DeliveryStatus, MessageId, QueuedMessageId};
use courier_common::Result;
use courier_storage::models::{Message, NewDelivery, QueuedMessage, Server};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Drives queued messages through the delivery pipeline
#[derive(Clone)]
pub struct Dequeuer {
    stores: Stores,
    config: DeliveryConfig,
    senders: Arc<dyn SenderFactory>,
    inspector: MessageInspector,
    metrics: Metrics,
    locker: String,
}

impl Dequeuer {
    pub fn new(
        stores: Stores,
        config: DeliveryConfig,
        senders: Arc<dyn SenderFactory>,
        inspector: MessageInspector,
        metrics: Metrics,
        locker: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            config,
            senders,
            inspector,
            metrics,
            locker: locker.into(),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Name written into the leases this dequeuer takes
    pub fn locker(&self) -> &str {
        &self.locker
    }

    /// Process a queued message and its batch. Never fails: errors are
    /// logged and the affected messages are rescheduled.
    pub async fn dequeue(&self, queued_message_id: QueuedMessageId) {
        let span = info_span!("dequeue", original_queued_message_id = %queued_message_id);
        async {
            info!("starting message unqueue");
            if let Err(e) = self.run(queued_message_id).await {
                error!(code = e.code(), "message unqueue failed: {}", e);
            }
            info!("finished message unqueue");
        }
        .instrument(span)
        .await
    }

    async fn run(&self, id: QueuedMessageId) -> Result<()> {
        self.metrics.dequeue_started();

        let Some(queued) = self.stores.queue.get(id).await? else {
            debug!("queued message no longer exists");
            return Ok(());
        };

        if queued.is_locked() {
            debug!(
                locked_by = queued.locked_by.as_deref().unwrap_or_default(),
                "skipping because message is leased by another worker"
            );
            return Ok(());
        }

        let Some(message) = self.stores.messages.get(queued.message_id).await? else {
            info!("unqueue because backend message has been removed");
            self.stores.queue.delete_lease(queued.id).await?;
            return Ok(());
        };

        if !queued.is_ready(Utc::now()) {
            debug!("skipping because message isn't ready for processing");
            return Ok(());
        }

        if !self.stores.queue.try_lease(queued.id, &self.locker).await? {
            debug!("lost the race for the lease");
            return Ok(());
        }

        let latency = (Utc::now() - queued.created_at).num_milliseconds() as f64 / 1000.0;
        info!("queue latency is {}s", latency);
        self.metrics.observe_queue_latency(latency.max(0.0));

        let siblings = self.lease_batch(&queued, &message).await?;

        let mut state = DequeueState::new(self.senders.clone());
        self.process(queued.id, &mut state).await;
        for sibling in siblings {
            self.process(sibling, &mut state).await;
        }
        state.finish().await;

        Ok(())
    }

    /// Lease the ready messages sharing the original's batch key
    async fn lease_batch(
        &self,
        queued: &QueuedMessage,
        message: &Message,
    ) -> Result<Vec<QueuedMessageId>> {
        if !self.config.batch_queued_messages {
            return Ok(Vec::new());
        }
        let Some(batch_key) = queued.batch_key.clone().or_else(|| message.batch_key()) else {
            return Ok(Vec::new());
        };

        let candidates = match self
            .stores
            .queue
            .find_eligible_siblings(
                &batch_key,
                queued.server_id,
                queued.ip_address_id,
                self.config.batch_size,
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                if let Err(unlock_err) = self.stores.queue.unlock(queued.id).await {
                    warn!("failed to release lease after batch lookup error: {}", unlock_err);
                }
                return Err(e);
            }
        };

        let mut leased = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate == queued.id {
                continue;
            }
            match self.stores.queue.try_lease(candidate, &self.locker).await {
                Ok(true) => leased.push(candidate),
                Ok(false) => debug!(queued_message_id = %candidate, "sibling was leased elsewhere"),
                Err(e) => debug!(queued_message_id = %candidate, "could not lease sibling: {}", e),
            }
        }

        info!(
            batch_key = %batch_key,
            "found {} associated messages to process at the same time",
            leased.len()
        );
        Ok(leased)
    }

    /// Append a delivery, stamping the hold expiry on held messages
    pub(crate) async fn record(&self, message_id: MessageId, mut delivery: NewDelivery) -> Result<()> {
        if delivery.status == DeliveryStatus::Held && delivery.hold_expiry.is_none() {
            delivery.hold_expiry =
                Some(Utc::now() + chrono::Duration::days(self.config.maximum_hold_expiry_days));
        }
        let status = delivery.status;
        self.stores.deliveries.record(message_id, delivery).await?;
        self.metrics.record_delivery(status);
        Ok(())
    }

    /// Queue a bounce for a message when it can be bounced
    pub(crate) async fn send_bounce(
        &self,
        server: &Server,
        message: &Message,
        raw: &[u8],
    ) -> Result<Option<MessageId>> {
        if !message.is_bounceable() {
            return Ok(None);
        }

        let route = match message.route_id {
            Some(id) => self.stores.routes.get_route(id).await?,
            None => None,
        };
        let domain = match message.domain_id {
            Some(id) => self.stores.routes.get_domain(id).await?,
            None => None,
        };

        let bounce = BounceMessage::new(
            server,
            message,
            route.as_ref(),
            domain.as_ref(),
            &self.config.return_path_domain,
        );
        let id = bounce.queue(&self.stores, raw).await?;
        Ok(Some(id))
    }
}
