//! Per-batch sender cache

use crate::sender::{Outbound, SendResult, Sender, SenderFactory, SenderKey, SenderTarget};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// State shared by the messages of one dequeue run.
///
/// Senders are started on first use and reused for every later message
/// with the same target. When a send fails to connect, the result is kept
/// and handed back for the rest of the batch instead of connecting again.
pub struct DequeueState {
    factory: Arc<dyn SenderFactory>,
    senders: HashMap<SenderKey, Box<dyn Sender>>,
    connect_failures: HashMap<SenderKey, SendResult>,
}

impl DequeueState {
    pub fn new(factory: Arc<dyn SenderFactory>) -> Self {
        Self {
            factory,
            senders: HashMap::new(),
            connect_failures: HashMap::new(),
        }
    }

    /// Started sender for a target
    pub async fn sender_for(&mut self, target: &SenderTarget) -> &mut Box<dyn Sender> {
        match self.senders.entry(target.key()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut sender = self.factory.build(target);
                sender.start().await;
                entry.insert(sender)
            }
        }
    }

    /// Send through the cached sender, or replay an earlier connect failure
    pub async fn send(&mut self, target: &SenderTarget, outbound: &Outbound<'_>) -> SendResult {
        let key = target.key();
        if let Some(result) = self.connect_failures.get(&key) {
            debug!("reusing connection failure from earlier in this batch");
            return result.clone();
        }

        let result = self.sender_for(target).await.send_message(outbound).await;
        if result.connect_error {
            self.connect_failures.insert(key, result.clone());
        }
        result
    }

    /// Number of senders opened during this run
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Close every sender once. Close errors are logged and dropped.
    pub async fn finish(&mut self) {
        for (key, mut sender) in self.senders.drain() {
            if let Err(e) = sender.finish().await {
                debug!("failed to close sender {:?}: {}", key, e);
            }
        }
        self.connect_failures.clear();
    }
}
