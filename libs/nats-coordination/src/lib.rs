//! # nats-coordination
//!
//! NATS-backed coordination for leader election.
//!
//! This library provides:
//! - **[`NatsClient`]**, one connection per process with credentials checked
//!   before dialing and a [`ConnectionState`] for health reporting.
//! - **[`NatsDriver`]**, a [`leader_election::Driver`] claiming election keys
//!   in a JetStream KV bucket whose `max_age` is the session TTL.
//! - **Claim records** stored as JSON under each election key.
//!
//! A lost connection surfaces as failed renewals. The claim is reported lost
//! shortly before the session TTL since the last successful renewal runs
//! out, ahead of the bucket dropping the value for every other process.

pub mod claim;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;

pub use claim::ClaimRecord;
pub use client::{ConnectionState, NatsClient};
pub use config::{Auth, NatsConfig, NatsSecurityMode};
pub use driver::NatsDriver;
pub use error::{CoordinationError, CoordinationResult};
