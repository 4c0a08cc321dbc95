//! Identity-scoped reactive cache for patient and session records.
//!
//! This crate keeps an in-memory mirror of a remote real-time document store,
//! scoped to the signed-in identity.
//!
//! ## Features
//!
//! - **Collection cache**: synchronous reads, optimistic writes, wholesale snapshot replacement
//! - **Subscription manager**: one owner-filtered subscription per collection, rebound on identity change
//! - **Change bus**: ordered synchronous notification plus an async stream
//! - **Cascade delete**: a patient and all of their sessions
//! - **Memory store**: in-process remote store for tests and tooling

pub mod bus;
pub mod cache;
mod clinic;
mod config;
mod error;
pub mod identity;
pub mod manager;
pub mod memory;
mod records;
pub mod remote;
mod types;
mod write;

pub use bus::{ChangeBus, DEFAULT_CHANGE_CHANNEL_CAPACITY, HandlerId, Topic};
pub use cache::CollectionCache;
pub use clinic::Clinic;
pub use config::{ClinicConfig, DEFAULT_FAILURE_CHANNEL_CAPACITY};
pub use error::{CascadeStep, StoreError, SyncError};
pub use identity::{AuthState, IdentitySource};
pub use manager::SubscriptionManager;
pub use memory::{MemoryStore, Operation};
pub use records::*;
pub use remote::{ErrorCallback, RemoteStore, SnapshotCallback, SubscriptionHandle};
pub use types::*;
pub use write::{PendingWrite, WriteFailure, WriteOp};
