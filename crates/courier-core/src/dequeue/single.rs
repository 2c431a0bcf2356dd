//! Single-message coordinator

use super::{DequeueState, Dequeuer, Outcome};
use crate::stores::Stores;
use chrono::Utc;
use courier_common::types::{DeliveryStatus, QueuedMessageId, Scope, ServerMode, SuppressionType};
use courier_common::{Error, Result};
use courier_storage::models::{Message, NewDelivery, QueuedMessage, Server};
use courier_storage::MessageStorage;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Longest delay a reschedule will use
const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// One message moving through a pipeline
pub(super) struct Pass<'a> {
    pub dequeuer: &'a Dequeuer,
    pub state: &'a mut DequeueState,
    pub queued: &'a QueuedMessage,
    pub message: Message,
    pub server: Server,
    pub raw: Vec<u8>,
}

impl Pass<'_> {
    pub fn stores(&self) -> &Stores {
        &self.dequeuer.stores
    }

    /// Write new raw content back to storage
    pub async fn replace_raw(&mut self, raw: Vec<u8>) -> Result<()> {
        let path = match &self.message.raw_path {
            Some(path) => path.clone(),
            None => MessageStorage::generate_path(&self.message.server_id, &self.message.id),
        };
        let size = raw.len() as i64;
        self.dequeuer.stores.raw.replace_raw(&path, &raw).await?;
        self.dequeuer
            .stores
            .messages
            .set_raw_path(self.message.id, &path, size)
            .await?;
        self.message.raw_path = Some(path);
        self.message.size = size;
        self.raw = raw;
        Ok(())
    }

    pub fn hold_if_development_mode(&self) -> Outcome {
        if self.queued.manual || self.server.mode_enum() != ServerMode::Development {
            return Outcome::Continue;
        }
        info!("server is in development mode, holding");
        Outcome::held("Server is in development mode.")
    }
}

impl Dequeuer {
    /// Process one leased message, isolating its errors and panics
    pub(super) async fn process(&self, id: QueuedMessageId, state: &mut DequeueState) {
        let span = info_span!("message", queued_message_id = %id);
        async {
            let queued = match self.stores.queue.get(id).await {
                Ok(Some(queued)) => queued,
                Ok(None) => {
                    info!("queued message has gone away");
                    return;
                }
                Err(e) => {
                    error!(code = e.code(), "could not load queued message: {}", e);
                    return;
                }
            };

            let result = AssertUnwindSafe(self.process_message(&queued, state))
                .catch_unwind()
                .await;
            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(panic) => Error::Internal(format!("panic: {}", panic_message(panic.as_ref()))),
            };
            self.handle_exception(&queued, &error).await;
        }
        .instrument(span)
        .await
    }

    async fn process_message(&self, queued: &QueuedMessage, state: &mut DequeueState) -> Result<()> {
        let Some(message) = self.stores.messages.get(queued.message_id).await? else {
            info!("unqueueing because backend message has been removed");
            self.stores.queue.delete_lease(queued.id).await?;
            return Ok(());
        };
        let message_id = message.id;

        let outcome = self.evaluate(queued, message, state).await?;
        self.finalize(queued, message_id, outcome).await
    }

    async fn evaluate(
        &self,
        queued: &QueuedMessage,
        message: Message,
        state: &mut DequeueState,
    ) -> Result<Outcome> {
        let Some(server) = self.stores.servers.get(message.server_id).await? else {
            return Err(Error::NotFound(format!("Server {}", message.server_id)));
        };

        if server.is_suspended() {
            info!("server is suspended, holding message");
            return Ok(Outcome::held(
                "Mail server has been suspended. No e-mails can be processed at present. Contact support for assistance.",
            ));
        }

        let raw = match &message.raw_path {
            Some(path) => self.stores.raw.read_raw(path).await?,
            None => None,
        };

        if queued.attempts >= self.config.maximum_delivery_attempts {
            return self
                .fail_after_max_attempts(queued, &server, &message, raw.as_deref())
                .await;
        }

        let Some(raw) = raw else {
            info!("raw message has been removed, not sending");
            return Ok(Outcome::hard_fail(
                "Raw message has been removed. Cannot send message.",
            ));
        };

        let scope = message.scope_enum();
        let pass = Pass {
            dequeuer: self,
            state,
            queued,
            message,
            server,
            raw,
        };

        match scope {
            Some(Scope::Incoming) => pass.incoming().await,
            Some(Scope::Outgoing) => pass.outgoing().await,
            None => Ok(Outcome::hard_fail(format!(
                "Scope {} is not valid",
                pass.message.scope
            ))),
        }
    }

    async fn fail_after_max_attempts(
        &self,
        queued: &QueuedMessage,
        server: &Server,
        message: &Message,
        raw: Option<&[u8]>,
    ) -> Result<Outcome> {
        let mut details = format!(
            "Maximum number of delivery attempts ({}) has been reached.",
            queued.attempts
        );

        match message.scope_enum() {
            Some(Scope::Incoming) => {
                if let Some(bounce_id) = self
                    .send_bounce(server, message, raw.unwrap_or_default())
                    .await?
                {
                    details.push_str(&format!(
                        " Bounce sent to sender (see message <msg:{}>)",
                        bounce_id
                    ));
                }
            }
            Some(Scope::Outgoing) => {
                let added = self
                    .stores
                    .suppressions
                    .add(
                        server.id,
                        SuppressionType::Recipient,
                        &message.rcpt_to,
                        Some("too many soft fails"),
                        None,
                    )
                    .await?;
                if added {
                    info!(
                        "added {} to suppression list because maximum attempts has been reached",
                        message.rcpt_to
                    );
                    details.push_str(&format!(
                        " Added {} to suppression list because delivery has failed {} times.",
                        message.rcpt_to, queued.attempts
                    ));
                }
            }
            None => {}
        }

        info!("message has reached maximum number of attempts, hard failing");
        Ok(Outcome::hard_fail(details))
    }

    /// Apply an outcome to the queue and the ledger
    pub(super) async fn finalize(
        &self,
        queued: &QueuedMessage,
        message_id: courier_common::types::MessageId,
        outcome: Outcome,
    ) -> Result<()> {
        match outcome {
            Outcome::Continue | Outcome::Remove => {
                self.stores.queue.delete_lease(queued.id).await?;
            }
            Outcome::Complete(delivery) => {
                self.record(message_id, delivery).await?;
                self.stores.queue.delete_lease(queued.id).await?;
                info!("message processing completed");
            }
            Outcome::Reschedule { delivery, after } => {
                self.record(message_id, delivery).await?;
                let retry_after = self.reschedule(queued, after).await?;
                info!(retry_after = %retry_after, "message requeued for trying later");

                if let Err(e) = self.reallocate_ip_address(queued).await {
                    warn!(code = e.code(), "could not allocate an egress address: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Move a requeued message to the next address of the server's pool
    async fn reallocate_ip_address(&self, queued: &QueuedMessage) -> Result<()> {
        let ip_address_id = self.stores.servers.allocate_ip_address(queued.server_id).await?;
        self.stores
            .queue
            .assign_ip_address(queued.id, ip_address_id)
            .await
    }

    async fn reschedule(
        &self,
        queued: &QueuedMessage,
        after: Option<Duration>,
    ) -> Result<chrono::DateTime<Utc>> {
        let delay = after
            .unwrap_or_else(|| self.config.retry_delay(queued.attempts))
            .min(MAX_RETRY_DELAY);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        let retry_after = Utc::now() + delay;
        self.stores.queue.reschedule(queued.id, retry_after).await?;
        Ok(retry_after)
    }

    /// Requeue after an unexpected failure and leave an `Error` delivery
    async fn handle_exception(&self, queued: &QueuedMessage, error: &Error) {
        error!(code = error.code(), "internal error: {}", error);

        match self.stores.queue.get(queued.id).await {
            Ok(Some(current)) if waiting_for_retry(&current) => {
                debug!("message already requeued, keeping its retry time");
            }
            Ok(Some(_)) => match self.reschedule(queued, None).await {
                Ok(retry_after) => {
                    info!(retry_after = %retry_after, "message requeued for trying later")
                }
                Err(e) => warn!("could not requeue message: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("could not reload queued message: {}", e),
        }

        let delivery = NewDelivery::new(DeliveryStatus::Error)
            .with_details(
                "An internal error occurred while sending this message. This message will be retried automatically.",
            )
            .with_output(format!("{}: {}", error.code(), error));
        if let Err(e) = self.record(queued.message_id, delivery).await {
            warn!("could not record error delivery: {}", e);
        }
    }
}

/// Unleased with a retry time still ahead
fn waiting_for_retry(queued: &QueuedMessage) -> bool {
    !queued.is_locked() && queued.retry_after.map_or(false, |at| at > Utc::now())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
