//! Result of a pipeline step

use courier_common::types::DeliveryStatus;
use courier_storage::models::NewDelivery;
use std::time::Duration;

/// What should happen to a queued message after a step
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Move on to the next step
    Continue,
    /// Record the delivery and delete the lease
    Complete(NewDelivery),
    /// Delete the lease without recording anything
    Remove,
    /// Record the delivery and try again later. `None` uses the backoff.
    Reschedule {
        delivery: NewDelivery,
        after: Option<Duration>,
    },
}

impl Outcome {
    pub fn complete(status: DeliveryStatus, details: impl Into<String>) -> Self {
        Outcome::Complete(NewDelivery::new(status).with_details(details))
    }

    pub fn held(details: impl Into<String>) -> Self {
        Self::complete(DeliveryStatus::Held, details)
    }

    pub fn hard_fail(details: impl Into<String>) -> Self {
        Self::complete(DeliveryStatus::HardFail, details)
    }

    pub fn processed(details: impl Into<String>) -> Self {
        Self::complete(DeliveryStatus::Processed, details)
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Outcome::Continue)
    }
}

/// Return early from a pipeline unless the step says to continue
macro_rules! guard {
    ($step:expr) => {
        match $step {
            $crate::dequeue::Outcome::Continue => {}
            outcome => return Ok(outcome),
        }
    };
}
