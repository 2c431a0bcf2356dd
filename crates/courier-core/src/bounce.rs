//! Bounce messages
//!
//! When an incoming message cannot be delivered the sender is told with a
//! bounce: a new outgoing message carrying a short explanation and the
//! original message as an attachment. The bounce is queued like any other
//! outgoing message.

use crate::stores::Stores;
use courier_common::types::{MessageId, Scope};
use courier_common::{Error, Result};
use courier_storage::models::{CreateMessage, Domain, EnqueueMessage, Message, Route, Server};
use mail_builder::MessageBuilder;
use tracing::info;
use uuid::Uuid;

/// A bounce for one undeliverable message
pub struct BounceMessage<'a> {
    server: &'a Server,
    message: &'a Message,
    route: Option<&'a Route>,
    domain: Option<&'a Domain>,
    return_path_domain: &'a str,
}

impl<'a> BounceMessage<'a> {
    pub fn new(
        server: &'a Server,
        message: &'a Message,
        route: Option<&'a Route>,
        domain: Option<&'a Domain>,
        return_path_domain: &'a str,
    ) -> Self {
        Self {
            server,
            message,
            route,
            domain,
            return_path_domain,
        }
    }

    /// Address users are told to contact
    pub fn postmaster_address(&self) -> String {
        match &self.server.postmaster_address {
            Some(address) if !address.trim().is_empty() => address.clone(),
            _ => format!(
                "postmaster@{}",
                self.domain
                    .map(|d| d.name.as_str())
                    .unwrap_or(self.return_path_domain)
            ),
        }
    }

    /// Address the bounce is sent from
    pub fn sender_address(&self) -> String {
        self.route
            .and_then(|route| route.description.clone())
            .filter(|description| !description.trim().is_empty())
            .unwrap_or_else(|| self.postmaster_address())
    }

    fn subject(&self) -> String {
        format!(
            "Mail Delivery Failed ({})",
            self.message.subject.as_deref().unwrap_or_default()
        )
    }

    fn body(&self) -> String {
        let sender = self.sender_address();
        format!(
            "This is the mail delivery service responsible for delivering mail to {sender}.\n\
             \n\
             The message you've sent cannot be delivered. Your original message is attached to this message.\n\
             \n\
             For further assistance please contact {postmaster}. Please include the details below to help us identify the issue.\n\
             \n\
             Message Token: {token}@{server_token}\n\
             Orginal Message ID: {message_id}\n\
             Mail from: {mail_from}\n\
             Rcpt To: {rcpt_to}\n",
            sender = sender,
            postmaster = self.postmaster_address(),
            token = self.message.token,
            server_token = self.server.token,
            message_id = self.message.message_id_header.as_deref().unwrap_or_default(),
            mail_from = self.message.mail_from,
            rcpt_to = self.message.rcpt_to,
        )
    }

    /// Render the bounce. Returns the raw message and its Message-ID.
    pub fn raw_message(&self, original: &[u8]) -> Result<(Vec<u8>, String)> {
        let sender = self.sender_address();
        let subject = self.subject();
        let body = self.body();
        let message_id = format!("{}@{}", Uuid::new_v4(), self.return_path_domain);

        let raw = MessageBuilder::new()
            .from(("Mail Delivery Service", sender.as_str()))
            .to(self.message.mail_from.as_str())
            .subject(subject.as_str())
            .message_id(message_id.as_str())
            .text_body(body.as_str())
            .attachment("message/rfc822", "Original Message.eml", original)
            .write_to_vec()
            .map_err(|e| Error::Internal(format!("Failed to build bounce message: {}", e)))?;

        Ok((raw, message_id))
    }

    /// Build the bounce and put it on the queue. Returns the new message's id.
    pub async fn queue(&self, stores: &Stores, original: &[u8]) -> Result<MessageId> {
        let (raw, message_id_header) = self.raw_message(original)?;
        let size = raw.len() as i64;

        let bounce = stores
            .messages
            .create(CreateMessage {
                server_id: self.server.id,
                scope: Scope::Outgoing,
                mail_from: self.sender_address(),
                rcpt_to: self.message.mail_from.clone(),
                raw_path: None,
                route_id: None,
                endpoint_type: None,
                endpoint_id: None,
                credential_id: None,
                domain_id: self.domain.map(|d| d.id),
                bounce: true,
                bounce_for_id: Some(self.message.id),
                subject: Some(self.subject()),
                message_id_header: Some(message_id_header),
                size,
            })
            .await?;

        let path = stores.raw.store_raw(&self.server.id, &bounce.id, &raw).await?;
        stores.messages.set_raw_path(bounce.id, &path, size).await?;

        let ip_address_id = stores.servers.allocate_ip_address(self.server.id).await?;
        stores
            .queue
            .enqueue(EnqueueMessage {
                message_id: bounce.id,
                server_id: self.server.id,
                domain: bounce.recipient_domain(),
                route_id: None,
                ip_address_id,
                batch_key: bounce.batch_key(),
                manual: false,
            })
            .await?;

        info!(
            "Queued bounce {} for message {} to {}",
            bounce.id, self.message.id, self.message.mail_from
        );
        Ok(bounce.id)
    }
}
