//! # leader-election
//!
//! Single-active-leader coordination for a fleet of identical service
//! instances. At most one instance leads a namespace at any time; the others
//! stand by and take over when the leader resigns or its session expires.
//!
//! This library provides:
//! - **[`Election`]**: the campaign / resign state machine used by the host.
//! - **[`Status`]**: a lock-free leadership flag for arbitrary readers.
//! - **[`Driver`]**: the backend capability performing the actual claim.
//!   [`MemoryDriver`] works in-process; a network-backed driver lives in the
//!   `nats-coordination` crate.
//! - **Events**: [`LeadershipEvent`]s handed to a [`Dispatcher`] on every
//!   transition.
//! - **[`Supervisor`]**: the long-running campaign loop for a host process.
//!
//! Mutual exclusion is the backend's job. The election only mirrors what the
//! backend confirmed.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod driver;
pub mod election;
pub mod error;
pub mod event;
pub mod key;
pub mod memory;
pub mod status;
pub mod supervise;

pub use config::ElectionConfig;
pub use driver::{Claim, Driver, RetryPolicy, SessionOptions};
pub use election::{Election, ElectionState};
pub use error::{ElectionError, ElectionResult};
pub use event::{
    BroadcastDispatcher, Dispatcher, FnListener, LeadershipEvent, Listener, NoopDispatcher,
    SyncDispatcher, Topic, TransitionReason, listen,
};
pub use key::Namespace;
pub use memory::{MemoryBackend, MemoryDriver};
pub use status::Status;
pub use supervise::Supervisor;
