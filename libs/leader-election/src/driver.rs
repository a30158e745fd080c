//! Backend capability performing the claim-and-hold protocol.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::config::ElectionConfig;
use crate::error::ElectionResult;

/// Default maximum retry attempts for transient backend failures.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retry policy for transient backend errors while acquiring a claim.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of consecutive failed attempts before giving up.
    pub max_retries: u32,
    /// Base delay between retries (actual delay uses exponential backoff).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Timing of a claim's session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// The backend drops a claim that was not renewed for this long.
    pub ttl: Duration,
    pub renew_interval: Duration,
    /// Poll interval while another holder owns the claim.
    pub retry_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ElectionConfig::default())
    }
}

impl From<&ElectionConfig> for SessionOptions {
    fn from(config: &ElectionConfig) -> Self {
        Self {
            ttl: config.session_ttl,
            renew_interval: config.renew_interval(),
            retry_interval: config.retry_interval,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// An acquired claim.
///
/// The driver fires [`Claim::lost`] once it can no longer confirm the claim:
/// renewal failed for longer than the session TTL, the backend handed the key
/// to someone else, the claim was released, or the campaign token was
/// cancelled.
#[derive(Debug, Clone)]
pub struct Claim {
    session: String,
    lost: CancellationToken,
}

impl Claim {
    /// `lost` is owned by the driver's session task.
    pub fn new(session: impl Into<String>, lost: CancellationToken) -> Self {
        Self {
            session: session.into(),
            lost,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the claim is no longer held.
    pub fn lost(&self) -> WaitForCancellationFuture<'_> {
        self.lost.cancelled()
    }
}

/// Mutual-exclusion primitive against a coordination backend.
///
/// The backend guarantees that only one claimant holds the key at a time and
/// drops the claim when its holder stops renewing.
#[async_trait]
pub trait Driver: Send + Sync + fmt::Debug {
    /// Block until the claim is acquired or `cancel` fires.
    ///
    /// After acquisition the claim is kept alive until `cancel` fires or
    /// [`resign`](Driver::resign) is called. Cancelling after acquisition
    /// releases the claim best-effort. Returns the held claim if there is one.
    async fn campaign(&self, cancel: CancellationToken) -> ElectionResult<Claim>;

    /// Release the held claim. `Ok` when nothing is held or the claim was
    /// already gone.
    async fn resign(&self, cancel: &CancellationToken) -> ElectionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
    }

    #[test]
    fn test_session_options_from_config() {
        let config = ElectionConfig {
            session_ttl: Duration::from_secs(9),
            ..Default::default()
        };
        let options = SessionOptions::from(&config);
        assert_eq!(options.ttl, Duration::from_secs(9));
        assert_eq!(options.renew_interval, Duration::from_secs(3));
        assert_eq!(options.retry_interval, config.retry_interval);
    }

    #[tokio::test]
    async fn test_claim_lost_signal() {
        let token = CancellationToken::new();
        let claim = Claim::new("s-1", token.clone());
        assert!(!claim.is_lost());
        token.cancel();
        claim.lost().await;
        assert!(claim.is_lost());
        assert_eq!(claim.session(), "s-1");
    }
}
