//! Outgoing message pipeline

use super::single::Pass;
use super::Outcome;
use crate::headers::{
    format_score, has_outgoing_headers, last_header, outgoing_headers, prepend_headers, TAG_HEADER,
};
use crate::sender::{Outbound, SendStatus, SenderTarget};
use crate::tracking::LinkTracker;
use chrono::{Duration, Utc};
use courier_common::types::{Scope, SuppressionType};
use courier_common::Result;
use courier_storage::models::{Domain, SendLimitState};
use tracing::{debug, info};

impl Pass<'_> {
    pub(super) async fn outgoing(mut self) -> Result<Outcome> {
        info!("message is outgoing");

        let Some(domain) = self.find_domain().await? else {
            info!("message has no domain, hard failing");
            return Ok(Outcome::hard_fail("Message's domain no longer exist"));
        };

        let recipient_domain = match self.message.recipient_domain() {
            Some(d) if !self.message.rcpt_to.trim().is_empty() => d,
            _ => {
                info!("message has no 'to' address, hard failing");
                return Ok(Outcome::hard_fail("Message doesn't have an RCPT to"));
            }
        };

        self.add_tag().await?;
        guard!(self.hold_if_credential_is_set_to_hold().await?);
        guard!(self.hold_if_recipient_on_suppression_list().await?);
        self.parse_content().await?;
        self.inspect_outgoing().await?;
        guard!(self.fail_if_outbound_spam());
        self.add_outgoing_headers().await?;
        guard!(self.check_send_limits().await?);
        self.stores()
            .live_stats
            .increment(self.server.id, Scope::Outgoing)
            .await?;
        guard!(self.hold_if_development_mode());

        let ip_address = match self.queued.ip_address_id {
            Some(id) => self.stores().servers.get_ip_address(id).await?,
            None => None,
        };
        let target = SenderTarget::Smtp {
            domain: recipient_domain,
            ip_address,
            servers: None,
            rcpt_to: None,
        };

        let return_path_domain = domain
            .effective_return_path_domain(&self.dequeuer.config.return_path_domain)
            .to_string();
        let outbound = Outbound {
            message: &self.message,
            server: &self.server,
            raw: &self.raw,
            return_path_domain: &return_path_domain,
        };
        let result = self.state.send(&target, &outbound).await;

        let mut delivery = result.to_delivery();
        match result.status {
            SendStatus::HardFail => {
                if self.suppress_after_hard_fails().await? {
                    delivery.append_details("Recipient added to suppression list (too many hard fails)");
                }
            }
            SendStatus::Sent => {
                let removed = self
                    .stores()
                    .suppressions
                    .remove(self.server.id, SuppressionType::Recipient, &self.message.rcpt_to)
                    .await?;
                if removed {
                    info!("removed {} from suppression list", self.message.rcpt_to);
                    delivery.append_details("Recipient removed from suppression list");
                }
            }
            SendStatus::SoftFail => {}
        }

        if result.retry.is_requested() {
            return Ok(Outcome::Reschedule {
                delivery,
                after: result.retry.delay(),
            });
        }
        Ok(Outcome::Complete(delivery))
    }

    async fn find_domain(&self) -> Result<Option<Domain>> {
        match self.message.domain_id {
            Some(id) => self.stores().routes.get_domain(id).await,
            None => Ok(None),
        }
    }

    async fn add_tag(&mut self) -> Result<()> {
        if self.message.tag.is_some() {
            return Ok(());
        }
        let Some(tag) = last_header(&self.raw, TAG_HEADER).filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        self.stores().messages.set_tag(self.message.id, &tag).await?;
        info!("added tag: {}", tag);
        self.message.tag = Some(tag);
        Ok(())
    }

    async fn hold_if_credential_is_set_to_hold(&self) -> Result<Outcome> {
        if self.queued.manual {
            return Ok(Outcome::Continue);
        }
        let Some(credential_id) = self.message.credential_id else {
            return Ok(Outcome::Continue);
        };
        match self.stores().routes.get_credential(credential_id).await? {
            Some(credential) if credential.hold => {
                info!("credential wants us to hold messages, holding");
                Ok(Outcome::held(
                    "Credential is configured to hold all messages authenticated by it.",
                ))
            }
            _ => Ok(Outcome::Continue),
        }
    }

    async fn hold_if_recipient_on_suppression_list(&self) -> Result<Outcome> {
        if self.queued.manual {
            return Ok(Outcome::Continue);
        }
        let entry = self
            .stores()
            .suppressions
            .get(self.server.id, SuppressionType::Recipient, &self.message.rcpt_to)
            .await?;
        let Some(entry) = entry else {
            return Ok(Outcome::Continue);
        };

        info!("recipient is on the suppression list, holding");
        Ok(Outcome::held(format!(
            "Recipient ({}) is on the suppression list (reason: {})",
            self.message.rcpt_to,
            entry.reason.unwrap_or_default()
        )))
    }

    fn should_parse(&self) -> bool {
        !self.message.parsed && last_header(&self.raw, "x-amp").as_deref() != Some("skip")
    }

    async fn parse_content(&mut self) -> Result<()> {
        if !self.should_parse() {
            return Ok(());
        }
        info!("parsing message content as it hasn't been parsed before");

        if let Some(base_url) = &self.dequeuer.config.track_base_url {
            let tracked = LinkTracker::new(base_url.as_str()).rewrite(
                &self.raw,
                &self.server.token,
                &self.message.token,
                &self.server.domains_not_to_click_track,
            );
            if let Some(raw) = tracked.raw {
                debug!(
                    tracked_links = tracked.tracked_links,
                    tracked_images = tracked.tracked_images,
                    "message content rewritten for tracking"
                );
                self.replace_raw(raw).await?;
            }
        }

        self.stores().messages.set_parsed(self.message.id).await?;
        self.message.parsed = true;
        Ok(())
    }

    async fn inspect_outgoing(&mut self) -> Result<()> {
        if self.message.inspected {
            return Ok(());
        }
        let Some(threshold) = self.server.outbound_spam_threshold else {
            return Ok(());
        };
        info!("inspecting message");

        let update = self
            .dequeuer
            .inspector
            .scan(&self.message, &self.raw, Scope::Outgoing)
            .await;
        self.stores()
            .messages
            .mark_inspected(self.message.id, &update)
            .await?;
        self.message.inspected = true;
        self.message.spam_score = update.spam_score;
        self.message.threat = update.threat;
        self.message.threat_details = update.threat_details;

        if self.message.spam_score >= threshold {
            self.stores().messages.set_spam(self.message.id, true).await?;
            self.message.spam = true;
        }

        info!(
            spam = self.message.spam,
            spam_score = self.message.spam_score,
            "message inspected successfully"
        );
        Ok(())
    }

    fn fail_if_outbound_spam(&self) -> Outcome {
        if !self.message.spam {
            return Outcome::Continue;
        }
        let threshold = self.server.outbound_spam_threshold.unwrap_or_default();
        info!(
            server_threshold = threshold,
            "message is spam ({}), hard failing",
            self.message.spam_score
        );
        Outcome::hard_fail(format!(
            "Message is likely spam. Threshold is {} and the message scored {}.",
            format_score(threshold),
            format_score(self.message.spam_score)
        ))
    }

    async fn add_outgoing_headers(&mut self) -> Result<()> {
        if has_outgoing_headers(&self.raw) {
            return Ok(());
        }
        let raw = prepend_headers(&self.raw, &outgoing_headers(&self.message.token));
        self.replace_raw(raw).await
    }

    async fn check_send_limits(&self) -> Result<Outcome> {
        let now = Utc::now();
        let mut outcome = Outcome::Continue;

        let state = match self.server.send_limit {
            Some(limit) => {
                let volume = self
                    .stores()
                    .live_stats
                    .total(self.server.id, 60, &[Scope::Outgoing])
                    .await?;
                let approaching_at =
                    f64::from(limit) * self.dequeuer.config.send_limit_approaching_ratio;

                if volume >= i64::from(limit) {
                    info!(send_limit = limit, "server send limit has been exceeded, holding");
                    outcome = Outcome::held(format!(
                        "Message held because send limit ({}) has been reached.",
                        limit
                    ));
                    SendLimitState {
                        approaching_at: None,
                        exceeded_at: Some(now),
                    }
                } else if volume as f64 >= approaching_at {
                    SendLimitState {
                        approaching_at: Some(now),
                        exceeded_at: None,
                    }
                } else {
                    SendLimitState {
                        approaching_at: None,
                        exceeded_at: None,
                    }
                }
            }
            None => SendLimitState {
                approaching_at: None,
                exceeded_at: None,
            },
        };

        self.stores()
            .servers
            .set_send_limit_state(self.server.id, state)
            .await?;
        Ok(outcome)
    }

    /// Suppress the recipient once enough recent hard fails pile up
    async fn suppress_after_hard_fails(&self) -> Result<bool> {
        let config = &self.dequeuer.config;
        let since = Utc::now() - Duration::hours(config.hard_fail_window_hours);
        let recent = self
            .stores()
            .messages
            .count_recent_hard_fails(self.server.id, &self.message.rcpt_to, since)
            .await?;
        if recent < config.hard_fail_suppression_threshold {
            return Ok(false);
        }

        let added = self
            .stores()
            .suppressions
            .add(
                self.server.id,
                SuppressionType::Recipient,
                &self.message.rcpt_to,
                Some("too many hard fails"),
                None,
            )
            .await?;
        if added {
            info!(
                "added {} to suppression list because {} hard fails in {} hours",
                self.message.rcpt_to, recent, config.hard_fail_window_hours
            );
        }
        Ok(added)
    }
}
