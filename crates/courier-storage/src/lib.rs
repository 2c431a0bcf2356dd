//! Courier Storage - Queue, ledger and raw message storage
//!
//! This crate provides the persistent state the delivery pipeline works
//! against: the lease/retry queue, messages and their delivery ledger,
//! suppression lists, server and route lookups, and raw message files.
//! Every repository is a trait with a PostgreSQL implementation and an
//! in-memory implementation used by tests and single-node tooling.

pub mod db;
pub mod file;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use file::{FileStorage, LocalStorage, MessageStorage};
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
