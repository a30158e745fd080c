//! [`Driver`] backed by a JetStream KV bucket.
//!
//! The election key holds a [`ClaimRecord`]. Acquisition is a `create`, which
//! only succeeds when the key has no live value. The holder keeps the value
//! alive with compare-and-set `update`s against the revision it last wrote;
//! the bucket's `max_age` removes the value once renewals stop, so a crashed
//! or partitioned holder loses the claim after one session TTL. The holder
//! stops trusting its claim slightly earlier than that.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_nats::jetstream::kv::{
    CreateErrorKind, DeleteErrorKind, Operation, Store, UpdateErrorKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use leader_election::{Claim, Driver, ElectionError, ElectionResult, Namespace, SessionOptions};
use tokio::{
    sync::{Mutex, OnceCell},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::claim::ClaimRecord;
use crate::client::NatsClient;
use crate::error::{CoordinationError, CoordinationResult};

/// The claim is trusted for `ttl - ttl / EXPIRY_MARGIN_DIVISOR` after a write.
const EXPIRY_MARGIN_DIVISOR: u32 = 10;

async fn bounded<F: Future>(
    limit: Duration,
    op: &str,
    key: &str,
    fut: F,
) -> CoordinationResult<F::Output> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        CoordinationError::Timeout(format!("{op} of '{key}' timed out after {limit:?}"))
    })
}

/// Outcome of one acquisition attempt.
enum Acquire {
    Won(Store, u64),
    /// Someone else holds the key; carries the holder when it could be read.
    Held(Store, Option<String>),
}

/// Renew and release operations on a claim this process holds.
#[async_trait]
trait ClaimSession: Send + Sync + 'static {
    async fn renew(&mut self) -> CoordinationResult<()>;

    /// `Ok(false)` when the claim was already gone.
    async fn release(&self) -> CoordinationResult<bool>;
}

/// A claim this process wrote, and the revision of its latest write.
#[derive(Debug, Clone)]
struct Session {
    store: Store,
    key: String,
    record: ClaimRecord,
    revision: Arc<AtomicU64>,
    request_timeout: Duration,
}

#[async_trait]
impl ClaimSession for Session {
    async fn renew(&mut self) -> CoordinationResult<()> {
        let record = self.record.renewed();
        let expected = self.revision.load(Ordering::Acquire);
        let payload = record.encode()?;
        let res = bounded(
            self.request_timeout,
            "renew",
            &self.key,
            self.store.update(&self.key, payload.into(), expected),
        )
        .await?;
        match res {
            Ok(next) => {
                self.revision.store(next, Ordering::Release);
                self.record = record;
                Ok(())
            }
            Err(err) if matches!(err.kind(), UpdateErrorKind::WrongLastRevision) => {
                Err(CoordinationError::RevisionConflict {
                    key: self.key.clone(),
                    expected,
                })
            }
            Err(err) => Err(CoordinationError::Transport(format!(
                "renew of '{}' failed: {err}",
                self.key
            ))),
        }
    }

    /// Delete the key if it still carries our revision.
    async fn release(&self) -> CoordinationResult<bool> {
        let expected = self.revision.load(Ordering::Acquire);
        let res = bounded(
            self.request_timeout,
            "release",
            &self.key,
            self.store.delete_expect_revision(&self.key, Some(expected)),
        )
        .await?;
        match res {
            Ok(()) => Ok(true),
            Err(err) if matches!(err.kind(), DeleteErrorKind::WrongLastRevision) => Ok(false),
            Err(err) => Err(CoordinationError::Transport(format!(
                "release of '{}' failed: {err}",
                self.key
            ))),
        }
    }
}

/// How long after a write this process still trusts the claim. The bucket
/// drops the value `ttl` after the server applied the write; the margin
/// covers the gap between sending it and the server applying it.
fn trust_window(ttl: Duration) -> Duration {
    ttl.saturating_sub(ttl / EXPIRY_MARGIN_DIVISOR)
}

/// Background renewal of one held claim.
struct Renewal<S> {
    session: S,
    key: String,
    session_id: String,
    options: SessionOptions,
}

impl<S: ClaimSession> Renewal<S> {
    /// Renew every `renew_interval` until stopped. Fires `lost` when a
    /// renewal conflicts or no write succeeded within the trust window of
    /// `written`, the moment the last successful write was sent.
    async fn run(
        mut self,
        written: Instant,
        cancel: CancellationToken,
        stop: CancellationToken,
        lost: CancellationToken,
    ) {
        let window = trust_window(self.options.ttl);
        let expiry = tokio::time::sleep_until(written + window);
        tokio::pin!(expiry);
        let mut ticker = tokio::time::interval(self.options.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = cancel.cancelled() => {
                    self.release_on_cancel().await;
                    break;
                }
                _ = &mut expiry => {
                    self.log_expired();
                    break;
                }
                _ = ticker.tick() => {
                    let sent = Instant::now();
                    let renewed = tokio::select! {
                        res = self.session.renew() => res,
                        _ = &mut expiry => {
                            self.log_expired();
                            break;
                        }
                    };
                    match renewed {
                        Ok(()) => expiry.as_mut().reset(sent + window),
                        Err(err) if err.is_conflict() => {
                            warn!(election = %self.key, session = %self.session_id, "claim expired or taken over, session lost");
                            break;
                        }
                        Err(err) => warn!(election = %self.key, error = %err, "claim renewal failed, retrying"),
                    }
                }
            }
        }
        lost.cancel();
    }

    async fn release_on_cancel(&self) {
        match self.session.release().await {
            Ok(true) => info!(election = %self.key, session = %self.session_id, "released claim after campaign cancellation"),
            Ok(false) => debug!(election = %self.key, "claim already gone on cancellation"),
            Err(err) => warn!(election = %self.key, error = %err, "failed to release claim on cancellation, relying on session expiry"),
        }
    }

    fn log_expired(&self) {
        warn!(
            election = %self.key,
            session = %self.session_id,
            ttl_ms = self.options.ttl.as_millis(),
            "no successful renewal within the session ttl, session lost"
        );
    }
}

#[derive(Debug)]
struct Held {
    claim: Claim,
    session: Session,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Claims an election key in the client's KV bucket.
#[derive(Debug)]
pub struct NatsDriver {
    client: NatsClient,
    key: String,
    holder: String,
    options: SessionOptions,
    store: OnceCell<Store>,
    held: Mutex<Option<Held>>,
}

impl NatsDriver {
    /// `holder` identifies this process in the claim record.
    pub fn new(
        client: NatsClient,
        namespace: &Namespace,
        holder: impl Into<String>,
        options: SessionOptions,
    ) -> Self {
        Self {
            client,
            key: namespace.key(),
            holder: holder.into(),
            options,
            store: OnceCell::new(),
            held: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    async fn store(&self) -> CoordinationResult<Store> {
        self.store
            .get_or_try_init(|| self.client.claims_store(self.options.ttl))
            .await
            .cloned()
    }

    async fn try_acquire(&self, record: &ClaimRecord) -> CoordinationResult<Acquire> {
        let store = self.store().await?;
        let limit = self.client.request_timeout();
        let payload = record.encode()?;
        match bounded(limit, "create", &self.key, store.create(&self.key, payload.into())).await? {
            Ok(revision) => return Ok(Acquire::Won(store, revision)),
            Err(err) if matches!(err.kind(), CreateErrorKind::AlreadyExists) => {}
            Err(err) => {
                return Err(CoordinationError::Transport(format!(
                    "create of '{}' failed: {err}",
                    self.key
                )));
            }
        }

        // a create whose reply was lost may still have landed
        let entry = bounded(limit, "read", &self.key, store.entry(self.key.clone()))
            .await?
            .map_err(|e| {
                CoordinationError::Transport(format!("read of '{}' failed: {e}", self.key))
            })?;
        let Some(entry) = entry.filter(|e| matches!(e.operation, Operation::Put)) else {
            return Ok(Acquire::Held(store, None));
        };
        match ClaimRecord::decode(&entry.value) {
            Ok(current) if current.session_id == record.session_id => {
                Ok(Acquire::Won(store, entry.revision))
            }
            Ok(current) => Ok(Acquire::Held(store, Some(current.holder))),
            Err(err) => {
                // nobody renews an unreadable value, it expires with the bucket max_age
                warn!(election = %self.key, error = %err, "unreadable claim record, waiting for it to expire");
                Ok(Acquire::Held(store, None))
            }
        }
    }

    /// Wait until the key is deleted, the retry interval passes, or `cancel`
    /// fires. Expiry through `max_age` produces no watch event, hence the
    /// interval.
    async fn wait_for_release(&self, store: &Store, cancel: &CancellationToken) {
        let released = async {
            match store.watch(&self.key).await {
                Ok(mut watch) => {
                    while let Some(entry) = watch.next().await {
                        match entry {
                            Ok(entry)
                                if matches!(
                                    entry.operation,
                                    Operation::Delete | Operation::Purge
                                ) =>
                            {
                                return;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!(election = %self.key, error = %err, "claim watch failed");
                                break;
                            }
                        }
                    }
                }
                Err(err) => debug!(election = %self.key, error = %err, "could not watch claim"),
            }
            futures::future::pending::<()>().await
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = released => {}
            _ = tokio::time::sleep(self.options.retry_interval) => {}
        }
    }
}

#[async_trait]
impl Driver for NatsDriver {
    async fn campaign(&self, cancel: CancellationToken) -> ElectionResult<Claim> {
        {
            let mut held = self.held.lock().await;
            if let Some(current) = held.as_ref() {
                if !current.claim.is_lost() {
                    return Ok(current.claim.clone());
                }
            }
            *held = None;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let record = ClaimRecord::new(&self.holder, &session_id, &self.key);
        let policy = &self.options.retry_policy;
        let mut failures = 0u32;
        // start of an attempt whose create may have landed without a reply
        let mut unconfirmed: Option<Instant> = None;
        let (store, revision, written) = loop {
            if cancel.is_cancelled() {
                return Err(ElectionError::Cancelled(format!(
                    "campaign for '{}' cancelled before acquisition",
                    self.key
                )));
            }
            let started = Instant::now();
            let err = match self.try_acquire(&record).await {
                Ok(Acquire::Won(store, revision)) => {
                    break (store, revision, unconfirmed.unwrap_or(started));
                }
                Ok(Acquire::Held(store, holder)) => {
                    failures = 0;
                    unconfirmed = None;
                    debug!(election = %self.key, holder = holder.as_deref().unwrap_or("unknown"), "claim held elsewhere, waiting");
                    self.wait_for_release(&store, &cancel).await;
                    continue;
                }
                Err(err) => err,
            };
            unconfirmed = Some(started);
            if !err.is_retryable() {
                return Err(err.into());
            }
            failures += 1;
            if failures > policy.max_retries {
                return Err(CoordinationError::MaxRetriesExhausted {
                    attempts: failures,
                    last: err.to_string(),
                }
                .into());
            }
            let delay = policy.delay(failures);
            warn!(
                election = %self.key,
                attempt = failures,
                retry_in_ms = delay.as_millis(),
                error = %err,
                "claim attempt failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        };
        info!(election = %self.key, session = %session_id, revision, "claim acquired");

        let session = Session {
            store,
            key: self.key.clone(),
            record,
            revision: Arc::new(AtomicU64::new(revision)),
            request_timeout: self.client.request_timeout(),
        };
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let renewal = Renewal {
            session: session.clone(),
            key: self.key.clone(),
            session_id: session_id.clone(),
            options: self.options.clone(),
        };
        let task = tokio::spawn(renewal.run(written, cancel, stop.clone(), lost.clone()));
        let claim = Claim::new(session_id, lost);
        *self.held.lock().await = Some(Held {
            claim: claim.clone(),
            session,
            stop,
            task,
        });
        Ok(claim)
    }

    async fn resign(&self, cancel: &CancellationToken) -> ElectionResult<()> {
        let Some(held) = self.held.lock().await.take() else {
            return Ok(());
        };
        held.stop.cancel();
        let _ = held.task.await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ElectionError::Cancelled(format!(
                "resign of '{}' cancelled before release was confirmed",
                self.key
            ))),
            res = held.session.release() => match res {
                Ok(true) => {
                    info!(election = %self.key, session = %held.claim.session(), "claim released");
                    Ok(())
                }
                Ok(false) => {
                    debug!(election = %self.key, "claim already gone, nothing to release");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}
