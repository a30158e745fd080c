//! Leadership transition events and the dispatchers that deliver them.
//!
//! An [`Election`](crate::Election) hands one [`LeadershipEvent`] to its
//! [`Dispatcher`] per transition, after the [`Status`](crate::Status) flag
//! has already been flipped. Delivery is bounded by the election's dispatch
//! timeout, so a slow subscriber delays the next transition at most by that
//! much and never changes the outcome of the current one.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Default capacity of the [`BroadcastDispatcher`] channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// The two named transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    BecameLeader,
    LostLeadership,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::BecameLeader => write!(f, "became_leader"),
            Topic::LostLeadership => write!(f, "lost_leadership"),
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// The claim was acquired.
    Elected,
    /// The host called `resign`.
    Resigned,
    /// The backend stopped confirming the claim.
    SessionLost,
    /// The campaign token was cancelled while leading.
    Stopped,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::Elected => write!(f, "elected"),
            TransitionReason::Resigned => write!(f, "resigned"),
            TransitionReason::SessionLost => write!(f, "session_lost"),
            TransitionReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Notification describing one leadership transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipEvent {
    /// Election identity (the namespace key).
    pub election: String,
    /// The new leadership state.
    pub is_leader: bool,
    pub reason: TransitionReason,
    /// Session id of the claim that was acquired or lost.
    pub session: String,
    pub at: DateTime<Utc>,
}

impl LeadershipEvent {
    pub fn new(
        election: impl Into<String>,
        is_leader: bool,
        reason: TransitionReason,
        session: impl Into<String>,
    ) -> Self {
        Self {
            election: election.into(),
            is_leader,
            reason,
            session: session.into(),
            at: Utc::now(),
        }
    }

    pub fn topic(&self) -> Topic {
        if self.is_leader {
            Topic::BecameLeader
        } else {
            Topic::LostLeadership
        }
    }
}

/// Publish/subscribe bus receiving leadership events.
#[async_trait]
pub trait Dispatcher: Send + Sync + fmt::Debug {
    async fn dispatch(&self, event: LeadershipEvent) -> anyhow::Result<()>;
}

/// Dispatcher that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn dispatch(&self, event: LeadershipEvent) -> anyhow::Result<()> {
        trace!(topic = %event.topic(), election = %event.election, "dropping leadership event");
        Ok(())
    }
}

/// A subscriber interested in one topic.
#[async_trait]
pub trait Listener: Send + Sync {
    fn topic(&self) -> Topic;

    async fn process(&self, event: &LeadershipEvent) -> anyhow::Result<()>;
}

/// Listener built from a closure, see [`listen`].
pub struct FnListener<F> {
    topic: Topic,
    callback: F,
}

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Create a listener for `topic` in one line.
///
/// ```ignore
/// dispatcher.subscribe(listen(Topic::BecameLeader, |event| {
///     info!(election = %event.election, "start cron jobs");
///     Ok(())
/// }));
/// ```
pub fn listen<F>(topic: Topic, callback: F) -> FnListener<F>
where
    F: Fn(&LeadershipEvent) -> anyhow::Result<()> + Send + Sync,
{
    FnListener { topic, callback }
}

#[async_trait]
impl<F> Listener for FnListener<F>
where
    F: Fn(&LeadershipEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn topic(&self) -> Topic {
        self.topic
    }

    async fn process(&self, event: &LeadershipEvent) -> anyhow::Result<()> {
        (self.callback)(event)
    }
}

/// Runs the matching listeners in registration order, inside `dispatch`.
#[derive(Default, Clone)]
pub struct SyncDispatcher {
    listeners: Arc<parking_lot::RwLock<Vec<Arc<dyn Listener>>>>,
}

impl fmt::Debug for SyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl SyncDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns `self` for chaining.
    pub fn subscribe(&self, listener: impl Listener + 'static) -> &Self {
        self.listeners.write().push(Arc::new(listener));
        self
    }
}

#[async_trait]
impl Dispatcher for SyncDispatcher {
    /// Every matching listener runs even if an earlier one fails; the first
    /// failure is returned.
    async fn dispatch(&self, event: LeadershipEvent) -> anyhow::Result<()> {
        let topic = event.topic();
        // snapshot so no lock is held across listener awaits
        let listeners = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.topic() == topic)
            .cloned()
            .collect::<Vec<_>>();

        let mut first_err = None;
        for listener in listeners {
            if let Err(err) = listener.process(&event).await {
                warn!(%topic, election = %event.election, ?err, "leadership listener failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Fans events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    tx: broadcast::Sender<LeadershipEvent>,
}

impl Default for BroadcastDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Dispatcher for BroadcastDispatcher {
    async fn dispatch(&self, event: LeadershipEvent) -> anyhow::Result<()> {
        if self.tx.send(event).is_err() {
            debug!("no leadership event subscribers");
        }
        Ok(())
    }
}
