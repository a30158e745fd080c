//! In-process coordination backend.
//!
//! [`MemoryBackend`] is a lease table shared by any number of
//! [`MemoryDriver`]s, each standing in for one process. It honours session
//! TTLs like a real backend and can forcibly [`revoke`](MemoryBackend::revoke)
//! a claim to simulate a partitioned or crashed holder.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{Claim, Driver, SessionOptions};
use crate::error::{ElectionError, ElectionResult};
use crate::key::Namespace;

#[derive(Debug, Clone)]
struct Lease {
    session: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct BackendInner {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
}

/// Shared in-memory lease table.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_claim(&self, key: &str, session: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.inner.leases.lock();
        match leases.get(key) {
            Some(lease) if lease.expires_at > now && lease.session != session => false,
            _ => {
                leases.insert(
                    key.to_owned(),
                    Lease {
                        session: session.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    fn renew(&self, key: &str, session: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.inner.leases.lock();
        match leases.get_mut(key) {
            Some(lease) if lease.session == session && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    fn release(&self, key: &str, session: &str) -> bool {
        let removed = {
            let mut leases = self.inner.leases.lock();
            match leases.get(key) {
                Some(lease) if lease.session == session => leases.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.inner.released.notify_waiters();
        }
        removed
    }

    /// Session currently holding `key`, if its lease has not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.inner
            .leases
            .lock()
            .get(key)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.session.clone())
    }

    /// Drop the claim on `key` as if its session had expired. Returns the
    /// session that held it.
    pub fn revoke(&self, key: &str) -> Option<String> {
        let removed = self.inner.leases.lock().remove(key);
        if removed.is_some() {
            self.inner.released.notify_waiters();
        }
        removed.map(|lease| lease.session)
    }
}

#[derive(Debug)]
struct Held {
    claim: Claim,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Driver for one process contending on a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryDriver {
    backend: MemoryBackend,
    key: String,
    options: SessionOptions,
    held: tokio::sync::Mutex<Option<Held>>,
}

impl MemoryDriver {
    pub fn new(backend: MemoryBackend, namespace: &Namespace, options: SessionOptions) -> Self {
        Self {
            backend,
            key: namespace.key(),
            options,
            held: tokio::sync::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

async fn keep_alive(
    backend: MemoryBackend,
    key: String,
    session: String,
    options: SessionOptions,
    cancel: CancellationToken,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let mut ticker = tokio::time::interval(options.renew_interval);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = cancel.cancelled() => {
                if backend.release(&key, &session) {
                    info!(election = %key, %session, "released claim after campaign cancellation");
                }
                break;
            }
            _ = ticker.tick() => {
                if !backend.renew(&key, &session, options.ttl) {
                    warn!(election = %key, %session, "claim no longer held, session lost");
                    break;
                }
            }
        }
    }
    lost.cancel();
}

#[async_trait]
impl Driver for MemoryDriver {
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

        let session = uuid::Uuid::new_v4().to_string();
        loop {
            if cancel.is_cancelled() {
                return Err(ElectionError::Cancelled(format!(
                    "campaign for '{}' cancelled before acquisition",
                    self.key
                )));
            }
            let released = self.backend.inner.released.notified();
            if self.backend.try_claim(&self.key, &session, self.options.ttl) {
                break;
            }
            debug!(election = %self.key, "claim held elsewhere, waiting");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = released => {}
                _ = tokio::time::sleep(self.options.retry_interval) => {}
            }
        }

        let lost = CancellationToken::new();
        let stop = CancellationToken::new();
        let task = tokio::spawn(keep_alive(
            self.backend.clone(),
            self.key.clone(),
            session.clone(),
            self.options.clone(),
            cancel,
            stop.clone(),
            lost.clone(),
        ));
        let claim = Claim::new(session, lost);
        *self.held.lock().await = Some(Held {
            claim: claim.clone(),
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
        if cancel.is_cancelled() {
            // renewal has stopped, the lease runs out on its own
            return Err(ElectionError::Cancelled(format!(
                "resign of '{}' cancelled before release",
                self.key
            )));
        }
        self.backend.release(&self.key, held.claim.session());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SessionOptions {
        SessionOptions {
            ttl: Duration::from_millis(300),
            renew_interval: Duration::from_millis(50),
            retry_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn namespace() -> Namespace {
        Namespace::new("memory", "test").unwrap()
    }

    #[test]
    fn test_backend_exclusive_claim() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(5);
        assert!(backend.try_claim("k", "a", ttl));
        assert!(!backend.try_claim("k", "b", ttl));
        assert_eq!(backend.holder("k").as_deref(), Some("a"));
        assert!(backend.renew("k", "a", ttl));
        assert!(!backend.renew("k", "b", ttl));
        assert!(!backend.release("k", "b"));
        assert!(backend.release("k", "a"));
        assert!(backend.try_claim("k", "b", ttl));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_lease_expires() {
        let backend = MemoryBackend::new();
        assert!(backend.try_claim("k", "a", Duration::from_secs(1)));
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(backend.holder("k").is_none());
        assert!(!backend.renew("k", "a", Duration::from_secs(1)));
        assert!(backend.try_claim("k", "b", Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_driver_campaign_and_resign() {
        let backend = MemoryBackend::new();
        let driver = MemoryDriver::new(backend.clone(), &namespace(), options());
        let claim = driver.campaign(CancellationToken::new()).await.unwrap();
        assert_eq!(backend.holder(driver.key()).as_deref(), Some(claim.session()));

        // held claim is returned again
        let again = driver.campaign(CancellationToken::new()).await.unwrap();
        assert_eq!(again.session(), claim.session());

        driver.resign(&CancellationToken::new()).await.unwrap();
        assert!(claim.is_lost());
        assert!(backend.holder(driver.key()).is_none());

        // nothing held
        driver.resign(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_renews_past_ttl() {
        let backend = MemoryBackend::new();
        let driver = MemoryDriver::new(backend.clone(), &namespace(), options());
        let claim = driver.campaign(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!claim.is_lost());
        assert_eq!(backend.holder(driver.key()).as_deref(), Some(claim.session()));
    }

    #[tokio::test]
    async fn test_driver_detects_revoked_session() {
        let backend = MemoryBackend::new();
        let driver = MemoryDriver::new(backend.clone(), &namespace(), options());
        let claim = driver.campaign(CancellationToken::new()).await.unwrap();
        backend.revoke(driver.key());
        tokio::time::timeout(Duration::from_secs(2), claim.lost())
            .await
            .expect("loss detected");
    }

    #[tokio::test]
    async fn test_driver_cancel_releases_claim() {
        let backend = MemoryBackend::new();
        let driver = MemoryDriver::new(backend.clone(), &namespace(), options());
        let cancel = CancellationToken::new();
        let claim = driver.campaign(cancel.clone()).await.unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), claim.lost())
            .await
            .expect("loss signalled");
        assert!(backend.holder(driver.key()).is_none());
    }

    #[tokio::test]
    async fn test_driver_waits_for_holder() {
        let backend = MemoryBackend::new();
        let first = MemoryDriver::new(backend.clone(), &namespace(), options());
        let second = Arc::new(MemoryDriver::new(backend.clone(), &namespace(), options()));
        first.campaign(CancellationToken::new()).await.unwrap();

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.campaign(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        first.resign(&CancellationToken::new()).await.unwrap();
        let claim = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(backend.holder(second.key()).as_deref(), Some(claim.session()));
    }

    #[tokio::test]
    async fn test_driver_cancel_while_waiting() {
        let backend = MemoryBackend::new();
        let first = MemoryDriver::new(backend.clone(), &namespace(), options());
        let second = MemoryDriver::new(backend, &namespace(), options());
        first.campaign(CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = second.campaign(cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_resign_with_cancelled_token() {
        let backend = MemoryBackend::new();
        let driver = MemoryDriver::new(backend.clone(), &namespace(), options());
        let claim = driver.campaign(CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = driver.resign(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        // renewal stopped, claim is gone once the ttl passes
        assert!(claim.is_lost());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(backend.holder(driver.key()).is_none());
    }
}
