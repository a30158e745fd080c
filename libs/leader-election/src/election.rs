//! Election state machine.
//!
//! ```text
//!  Standby --campaign--> Campaigning --acquired--> Leading
//!     ^                      |                        |
//!     |                      | cancelled              | resign / session lost
//!     |                      v                        |
//!     |                   Stopped <--cancelled--------+
//!     +-----------------------------------------------+
//! ```
//!
//! Every change of [`Status`] and [`ElectionState`] happens under one async
//! transition lock, and the event for a transition is dispatched before the
//! lock is released, so transitions are totally ordered within a process.

use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_DISPATCH_TIMEOUT, DEFAULT_RELEASE_TIMEOUT, ElectionConfig};
use crate::driver::{Claim, Driver};
use crate::error::{ElectionError, ElectionResult};
use crate::event::{Dispatcher, LeadershipEvent, TransitionReason};
use crate::status::Status;

/// Where an [`Election`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectionState {
    /// Not leading and not campaigning.
    Standby,
    /// Blocked inside the driver waiting for the claim.
    Campaigning,
    /// Holding the claim.
    Leading,
    /// The campaign token was cancelled; nothing is held.
    Stopped,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionState::Standby => write!(f, "standby"),
            ElectionState::Campaigning => write!(f, "campaigning"),
            ElectionState::Leading => write!(f, "leading"),
            ElectionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Claim currently mirrored by the state machine.
#[derive(Debug, Default)]
struct Term {
    generation: u64,
    claim: Option<Claim>,
}

#[derive(Debug)]
struct Shared {
    id: String,
    driver: Arc<dyn Driver>,
    dispatcher: Arc<dyn Dispatcher>,
    status: Status,
    state: watch::Sender<ElectionState>,
    /// Serializes campaigns on this election.
    campaign_lock: Mutex<()>,
    /// Transition lock.
    term: Mutex<Term>,
    dispatch_timeout: Duration,
    release_timeout: Duration,
}

/// Coordination facade used by the host process.
///
/// Cheap to clone; clones drive the same election.
#[derive(Debug, Clone)]
pub struct Election {
    shared: Arc<Shared>,
}

impl Election {
    /// Create an election identified by `id` (usually a namespace key).
    pub fn new(
        id: impl Into<String>,
        driver: Arc<dyn Driver>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self::build(
            id.into(),
            driver,
            dispatcher,
            DEFAULT_DISPATCH_TIMEOUT,
            DEFAULT_RELEASE_TIMEOUT,
        )
    }

    /// Like [`Election::new`], taking the timeouts from `config`.
    pub fn with_config(
        id: impl Into<String>,
        driver: Arc<dyn Driver>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &ElectionConfig,
    ) -> Self {
        Self::build(
            id.into(),
            driver,
            dispatcher,
            config.dispatch_timeout,
            config.release_timeout,
        )
    }

    fn build(
        id: String,
        driver: Arc<dyn Driver>,
        dispatcher: Arc<dyn Dispatcher>,
        dispatch_timeout: Duration,
        release_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ElectionState::Standby);
        Self {
            shared: Arc::new(Shared {
                id,
                driver,
                dispatcher,
                status: Status::new(),
                state,
                campaign_lock: Mutex::new(()),
                term: Mutex::new(Term::default()),
                dispatch_timeout,
                release_timeout,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Leadership flag shared with arbitrary readers.
    pub fn status(&self) -> Status {
        self.shared.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.status.is_leader()
    }

    pub fn state(&self) -> ElectionState {
        *self.shared.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the election is no longer [`ElectionState::Leading`].
    pub async fn wait_for_loss(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state != ElectionState::Leading).await;
    }

    /// Campaign for leadership.
    ///
    /// Returns once leadership is first acquired or `cancel` fires, whichever
    /// comes first. Later losses are reported through [`Status`] and events
    /// only. Returns `Ok` right away when already leading. A second call made
    /// while a campaign is in flight waits for it and then returns `Ok` if it
    /// won, or campaigns itself if it did not.
    ///
    /// After acquisition, cancelling `cancel` releases the claim and moves the
    /// election to [`ElectionState::Stopped`].
    pub async fn campaign(&self, cancel: CancellationToken) -> ElectionResult<()> {
        let shared = &self.shared;
        if cancel.is_cancelled() {
            shared.state.send_if_modified(|state| match state {
                ElectionState::Standby => {
                    *state = ElectionState::Stopped;
                    true
                }
                _ => false,
            });
            return Err(ElectionError::Cancelled(format!(
                "campaign for '{}' called with a cancelled token",
                shared.id
            )));
        }

        let _campaign = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ElectionError::Cancelled(format!(
                    "campaign for '{}' cancelled while another campaign was in flight",
                    shared.id
                )));
            }
            guard = shared.campaign_lock.lock() => guard,
        };

        {
            let term = shared.term.lock().await;
            if term.claim.is_some() {
                debug!(election = %shared.id, "already leading, campaign is a no-op");
                return Ok(());
            }
            shared.state.send_replace(ElectionState::Campaigning);
        }
        info!(election = %shared.id, "campaigning for leadership");

        let claim = match shared.driver.campaign(cancel.clone()).await {
            Ok(claim) => claim,
            Err(err) => {
                let next = if err.is_cancelled() || cancel.is_cancelled() {
                    debug!(election = %shared.id, "campaign cancelled");
                    ElectionState::Stopped
                } else {
                    warn!(election = %shared.id, error = %err, "campaign failed");
                    ElectionState::Standby
                };
                let _term = shared.term.lock().await;
                shared.state.send_replace(next);
                return Err(err);
            }
        };

        let generation = {
            let mut term = shared.term.lock().await;
            term.generation += 1;
            term.claim = Some(claim.clone());
            shared
                .transition(
                    ElectionState::Leading,
                    TransitionReason::Elected,
                    claim.session(),
                )
                .await;
            term.generation
        };

        tokio::spawn(watch_claim(shared.clone(), generation, claim, cancel));
        Ok(())
    }

    /// Voluntarily give up leadership.
    ///
    /// No-op when not leading. Returns once the backend confirmed the release
    /// or `cancel` fired. On error the election keeps leading until the driver
    /// reports the claim as lost.
    pub async fn resign(&self, cancel: &CancellationToken) -> ElectionResult<()> {
        let shared = &self.shared;
        let mut term = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ElectionError::Cancelled(format!(
                    "resign of '{}' cancelled before it started",
                    shared.id
                )));
            }
            term = shared.term.lock() => term,
        };
        let Some(claim) = term.claim.clone() else {
            debug!(election = %shared.id, "not leading, nothing to resign");
            return Ok(());
        };

        shared.driver.resign(cancel).await?;
        term.claim = None;
        shared
            .transition(
                ElectionState::Standby,
                TransitionReason::Resigned,
                claim.session(),
            )
            .await;
        Ok(())
    }
}

impl Shared {
    /// Flip status, publish state, then dispatch the event. Callers hold the
    /// transition lock.
    async fn transition(&self, next: ElectionState, reason: TransitionReason, session: &str) {
        let is_leader = next == ElectionState::Leading;
        self.status.set(is_leader);
        self.state.send_replace(next);
        if is_leader {
            info!(election = %self.id, %session, "became leader");
        } else {
            info!(election = %self.id, %session, %reason, "lost leadership");
        }

        let event = LeadershipEvent::new(self.id.clone(), is_leader, reason, session);
        let topic = event.topic();
        match tokio::time::timeout(self.dispatch_timeout, self.dispatcher.dispatch(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(election = %self.id, %topic, ?err, "leadership event dispatch failed")
            }
            Err(_) => warn!(
                election = %self.id,
                %topic,
                timeout_ms = self.dispatch_timeout.as_millis(),
                "leadership event dispatch timed out"
            ),
        }
    }

    /// Best-effort release used when the campaign token is cancelled while
    /// leading. Callers hold the transition lock.
    async fn release(&self) {
        let release = CancellationToken::new();
        match tokio::time::timeout(self.release_timeout, self.driver.resign(&release)).await {
            Ok(Ok(())) => debug!(election = %self.id, "claim released on stop"),
            Ok(Err(err)) => warn!(election = %self.id, error = %err, "failed to release claim on stop"),
            Err(_) => {
                release.cancel();
                warn!(
                    election = %self.id,
                    timeout_ms = self.release_timeout.as_millis(),
                    "timed out releasing claim on stop, relying on session expiry"
                );
            }
        }
    }
}

/// Mirror loss of the claim of term `generation` into the state machine.
async fn watch_claim(
    shared: Arc<Shared>,
    generation: u64,
    claim: Claim,
    cancel: CancellationToken,
) {
    let reason = tokio::select! {
        _ = claim.lost() => {
            if cancel.is_cancelled() {
                TransitionReason::Stopped
            } else {
                TransitionReason::SessionLost
            }
        }
        _ = cancel.cancelled() => TransitionReason::Stopped,
    };

    let mut term = shared.term.lock().await;
    if term.generation != generation || term.claim.is_none() {
        // already resigned, or a newer term replaced this one
        return;
    }
    let next = if reason == TransitionReason::Stopped {
        shared.release().await;
        ElectionState::Stopped
    } else {
        ElectionState::Standby
    };
    term.claim = None;
    shared.transition(next, reason, claim.session()).await;
}
