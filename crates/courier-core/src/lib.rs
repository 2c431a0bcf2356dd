//! Courier Core - message dequeue and delivery pipeline
//!
//! This crate takes queued messages and drives them through inspection,
//! policy checks and transmission, recording every attempt in the
//! delivery ledger. It also carries the senders (SMTP and HTTP), the
//! bounce builder, the queue worker and the periodic maintenance tasks.

pub mod bounce;
pub mod dequeue;
pub mod headers;
pub mod inspection;
pub mod maintenance;
pub mod metrics;
pub mod sender;
pub mod stores;
pub mod tracking;
pub mod worker;

pub use bounce::BounceMessage;
pub use dequeue::Dequeuer;
pub use inspection::{Inspector, MessageInspector, RspamdInspector};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use metrics::Metrics;
pub use sender::{NetworkSenderFactory, SendResult, SendStatus, Sender, SenderFactory, SenderTarget};
pub use stores::Stores;
pub use worker::QueueWorker;
