//! Incoming message pipeline

use super::single::Pass;
use super::Outcome;
use crate::headers::{format_score, original_message_tokens, prepend_headers, spam_headers};
use crate::sender::{Outbound, SendStatus, SenderTarget, SmtpServerSpec};
use courier_common::types::{DeliveryStatus, RouteMode, Scope, SpamMode};
use courier_common::Result;
use courier_storage::models::{Endpoint, NewDelivery, Route};
use tracing::info;

impl Pass<'_> {
    pub(super) async fn incoming(mut self) -> Result<Outcome> {
        info!("message is incoming");

        guard!(self.handle_bounces().await?);
        self.stores()
            .live_stats
            .increment(self.server.id, Scope::Incoming)
            .await?;
        self.inspect_incoming().await?;
        guard!(self.fail_if_spam());
        guard!(self.hold_if_development_mode());

        let Some(route) = self.find_route().await? else {
            info!("no route and/or endpoint available for processing, hard failing");
            return Ok(Outcome::hard_fail(
                "Message does not have a route and/or endpoint available for delivery.",
            ));
        };

        guard!(self.hold_or_reject_spam(&route));
        guard!(self.apply_route_mode(&route).await?);

        let Some((target, endpoint)) = self.endpoint_target(&route).await? else {
            info!(
                "invalid endpoint for route ({})",
                self.message.endpoint_type.as_deref().unwrap_or("none")
            );
            return Ok(Outcome::hard_fail("Invalid endpoint for route."));
        };

        let return_path_domain = self.dequeuer.config.return_path_domain.clone();
        let outbound = Outbound {
            message: &self.message,
            server: &self.server,
            raw: &self.raw,
            return_path_domain: &return_path_domain,
        };
        let result = self.state.send(&target, &outbound).await;

        let mut delivery = result.to_delivery();
        if result.status == SendStatus::HardFail {
            if result.suppress_bounce {
                info!("suppressing bounce message after hard fail");
            } else if self.message.is_bounceable() {
                info!("sending a bounce because message hard failed");
                if let Some(bounce_id) = self
                    .dequeuer
                    .send_bounce(&self.server, &self.message, &self.raw)
                    .await?
                {
                    delivery.append_details(&format!(
                        "Sent bounce message to sender (see message <msg:{}>)",
                        bounce_id
                    ));
                }
            }
        }

        if result.retry.is_requested() {
            return Ok(Outcome::Reschedule {
                delivery,
                after: result.retry.delay(),
            });
        }

        self.stores().routes.mark_endpoint_used(&endpoint).await?;
        Ok(Outcome::Complete(delivery))
    }

    async fn handle_bounces(&mut self) -> Result<Outcome> {
        if !self.message.bounce {
            return Ok(Outcome::Continue);
        }
        info!("message is a bounce");

        let tokens = original_message_tokens(&self.raw);
        let originals = if tokens.is_empty() {
            Vec::new()
        } else {
            self.stores()
                .messages
                .find_by_tokens(self.server.id, &tokens)
                .await?
        };

        if !originals.is_empty() {
            for original in &originals {
                self.stores()
                    .messages
                    .link_bounce(self.message.id, original.id, original.domain_id)
                    .await?;
                self.message.bounce_for_id = Some(original.id);
                self.message.domain_id = original.domain_id;

                self.dequeuer
                    .record(
                        self.message.id,
                        NewDelivery::new(DeliveryStatus::Processed).with_details(format!(
                            "This has been detected as a bounce message for <msg:{}>.",
                            original.id
                        )),
                    )
                    .await?;
                self.dequeuer
                    .record(
                        original.id,
                        NewDelivery::new(DeliveryStatus::Bounced).with_details(format!(
                            "We've received a bounce message for this e-mail. See <msg:{}> for details.",
                            self.message.id
                        )),
                    )
                    .await?;
                info!(
                    target: "courier::events",
                    event = "MessageBounced",
                    original_message_id = %original.id,
                    bounce_message_id = %self.message.id,
                    server_id = %self.server.id,
                    "bounce linked with message {}",
                    original.id
                );
            }
            return Ok(Outcome::Remove);
        }

        if self.message.route_id.is_some() {
            return Ok(Outcome::Continue);
        }

        info!("no source messages found, hard failing");
        Ok(Outcome::hard_fail(
            "This message was a bounce but we couldn't link it with any outgoing message and there was no route for it.",
        ))
    }

    async fn inspect_incoming(&mut self) -> Result<()> {
        if self.message.inspected {
            return Ok(());
        }
        info!("inspecting message");

        let update = self
            .dequeuer
            .inspector
            .scan(&self.message, &self.raw, Scope::Incoming)
            .await;
        self.stores()
            .messages
            .mark_inspected(self.message.id, &update)
            .await?;
        self.message.inspected = true;
        self.message.spam_score = update.spam_score;
        self.message.threat = update.threat;
        self.message.threat_details = update.threat_details.clone();

        if update.spam_score > self.server.spam_threshold {
            self.stores().messages.set_spam(self.message.id, true).await?;
            self.message.spam = true;
            info!(
                "message is spam (scored {}, threshold is {})",
                update.spam_score, self.server.spam_threshold
            );
        }

        let headers = spam_headers(
            self.message.spam,
            self.server.spam_threshold,
            self.message.spam_score,
            self.message.threat,
        );
        let raw = prepend_headers(&self.raw, &headers);
        self.replace_raw(raw).await?;

        info!(
            spam = self.message.spam,
            spam_score = self.message.spam_score,
            threat = self.message.threat,
            "message inspected, headers added"
        );
        Ok(())
    }

    fn fail_if_spam(&self) -> Outcome {
        if self.message.spam_score < self.server.spam_failure_threshold {
            return Outcome::Continue;
        }
        info!(
            server_threshold = self.server.spam_failure_threshold,
            "message has a spam score higher than the server's maximum, hard failing"
        );
        Outcome::hard_fail(format!(
            "Message's spam score is higher than the failure threshold for this server. Threshold is currently {}.",
            format_score(self.server.spam_failure_threshold)
        ))
    }

    async fn find_route(&self) -> Result<Option<Route>> {
        match self.message.route_id {
            Some(id) => self.stores().routes.get_route(id).await,
            None => Ok(None),
        }
    }

    fn hold_or_reject_spam(&self, route: &Route) -> Outcome {
        if !self.message.spam || self.queued.manual {
            return Outcome::Continue;
        }
        match route.spam_mode_enum() {
            SpamMode::Quarantine => {
                info!("message is spam and route says to quarantine spam message, holding");
                Outcome::held("Message placed into quarantine.")
            }
            SpamMode::Fail => {
                info!("message is spam and route says to fail spam message, hard failing");
                Outcome::hard_fail("Message is spam and the route specifies it should be failed.")
            }
            SpamMode::Mark => Outcome::Continue,
        }
    }

    async fn apply_route_mode(&self, route: &Route) -> Result<Outcome> {
        let outcome = match route.mode_enum() {
            Some(RouteMode::Accept) => {
                info!("route says to accept without endpoint, marking as processed");
                Outcome::processed("Message has been accepted but not sent to any endpoints.")
            }
            Some(RouteMode::Hold) if self.queued.manual => {
                info!("route says to hold and message was queued manually, marking as processed");
                Outcome::processed("Message has been processed.")
            }
            Some(RouteMode::Hold) => {
                info!("route says to hold, marking as held");
                Outcome::held("Message has been accepted but not sent to any endpoints.")
            }
            Some(RouteMode::Bounce) | Some(RouteMode::Reject) => {
                info!("route says to bounce, hard failing and sending bounce");
                match self
                    .dequeuer
                    .send_bounce(&self.server, &self.message, &self.raw)
                    .await?
                {
                    Some(bounce_id) => {
                        info!("bounce sent with id {}", bounce_id);
                        Outcome::hard_fail(format!(
                            "Message has been bounced because the route asks for this. See message <msg:{}>",
                            bounce_id
                        ))
                    }
                    None => Outcome::hard_fail(
                        "Message has been bounced because the route asks for this.",
                    ),
                }
            }
            Some(RouteMode::Endpoint) | None => Outcome::Continue,
        };
        Ok(outcome)
    }

    /// Sender target for the message's endpoint, falling back to the route's
    async fn endpoint_target(&self, route: &Route) -> Result<Option<(SenderTarget, Endpoint)>> {
        let reference = match (&self.message.endpoint_type, self.message.endpoint_id) {
            (Some(kind), Some(id)) => Some((kind.clone(), id)),
            _ => match (&route.endpoint_type, route.endpoint_id) {
                (Some(kind), Some(id)) => Some((kind.clone(), id)),
                _ => None,
            },
        };
        let Some((kind, id)) = reference else {
            return Ok(None);
        };
        let Some(endpoint) = self.stores().routes.get_endpoint(&kind, id).await? else {
            return Ok(None);
        };

        let target = match &endpoint {
            Endpoint::Smtp(smtp) => {
                let Some(domain) = self.message.recipient_domain() else {
                    return Ok(None);
                };
                SenderTarget::Smtp {
                    domain,
                    ip_address: None,
                    servers: Some(vec![SmtpServerSpec::from_endpoint(smtp)]),
                    rcpt_to: None,
                }
            }
            Endpoint::Http(http) => SenderTarget::Http(http.clone()),
            Endpoint::Address(address) => {
                let Some(domain) = address.domain() else {
                    return Ok(None);
                };
                SenderTarget::Smtp {
                    domain,
                    ip_address: None,
                    servers: None,
                    rcpt_to: Some(address.address.clone()),
                }
            }
        };
        Ok(Some((target, endpoint)))
    }
}
