//! Queue worker - polls for ready messages and dispatches dequeue runs

use crate::dequeue::Dequeuer;
use courier_common::config::WorkerConfig;
use courier_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Queue worker
pub struct QueueWorker {
    dequeuer: Arc<Dequeuer>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl QueueWorker {
    pub fn new(dequeuer: Arc<Dequeuer>, config: WorkerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            dequeuer,
            config,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Poll the queue until the token is cancelled, then wait for the
    /// dequeue runs still in flight
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));

        info!(
            "Queue worker started (locker: {}, concurrency: {}, fetch: {}, interval: {}s)",
            self.dequeuer.locker(),
            self.config.concurrency,
            self.config.fetch_limit,
            self.config.poll_interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch(&shutdown).await {
                        error!("Error polling the queue: {}", e);
                    }
                }
            }
        }

        let permits = self.config.concurrency.max(1) as u32;
        if self.semaphore.acquire_many(permits).await.is_ok() {
            info!("Queue worker stopped");
        }
    }

    /// Dispatch one poll's worth of messages and wait for all of them
    pub async fn run_once(&self) -> Result<usize> {
        let handles = self.dispatch(&CancellationToken::new()).await?;
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Dequeue task failed: {}", e);
            }
        }
        Ok(count)
    }

    /// Spawn a dequeue run per ready message. Stops early, leaving the rest
    /// queued, when shutdown is requested while waiting for a free slot.
    async fn dispatch(&self, shutdown: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let ready = self
            .dequeuer
            .stores()
            .queue
            .find_ready(self.config.fetch_limit)
            .await?;

        if ready.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Dispatching {} queued messages", ready.len());

        let mut handles = Vec::with_capacity(ready.len());
        for id in ready {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, not dispatching further messages");
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => permit
                    .map_err(|e| Error::Internal(format!("worker semaphore closed: {}", e)))?,
            };
            let dequeuer = self.dequeuer.clone();

            handles.push(tokio::spawn(async move {
                dequeuer.dequeue(id).await;
                drop(permit);
            }));
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspection::MessageInspector;
    use crate::metrics::Metrics;
    use crate::sender::NetworkSenderFactory;
    use crate::stores::Stores;
    use courier_common::config::{DeliveryConfig, HttpSenderConfig, SmtpClientConfig};
    use courier_storage::models::EnqueueMessage;
    use courier_storage::{MemoryStore, QueueStore};
    use uuid::Uuid;

    fn worker(store: &MemoryStore) -> QueueWorker {
        let dequeuer = Dequeuer::new(
            Stores::from_memory(store),
            DeliveryConfig::default(),
            Arc::new(NetworkSenderFactory::new(
                SmtpClientConfig::default(),
                false,
                HttpSenderConfig::default(),
            )),
            MessageInspector::disabled(),
            Metrics::new().unwrap(),
            "test-worker",
        );
        QueueWorker::new(Arc::new(dequeuer), WorkerConfig::default())
    }

    #[tokio::test]
    async fn test_run_once_with_empty_queue() {
        let store = MemoryStore::new();
        assert_eq!(worker(&store).run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_once_propagates_poll_errors() {
        let store = MemoryStore::new();
        store.fail_operation("find_ready");
        assert!(worker(&store).run_once().await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let store = MemoryStore::new();
        let worker = worker(&store);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_waiting_for_a_slot() {
        let store = MemoryStore::new();
        let queued = QueueStore::enqueue(
            &store,
            EnqueueMessage {
                message_id: Uuid::new_v4(),
                server_id: Uuid::new_v4(),
                domain: Some("example.org".to_string()),
                route_id: None,
                ip_address_id: None,
                batch_key: None,
                manual: false,
            },
        )
        .await
        .unwrap();

        let worker = worker(&store);
        let slots = worker.semaphore.available_permits() as u32;
        let busy = worker.semaphore.clone().acquire_many_owned(slots).await.unwrap();

        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let handles = tokio::time::timeout(Duration::from_secs(5), worker.dispatch(&shutdown))
            .await
            .unwrap()
            .unwrap();
        assert!(handles.is_empty());
        assert!(store.queued(queued.id).is_some());
        drop(busy);
    }
}
