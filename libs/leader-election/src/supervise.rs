//! Long-running campaign loop for a host process.
//!
//! The host spawns [`Supervisor::run`] next to its other components and
//! cancels the shutdown token on exit. The supervisor resigns before it
//! cancels its own campaign token, so a graceful shutdown hands leadership
//! over without waiting for the session to expire.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;
use crate::election::Election;
use crate::error::{ElectionError, ElectionResult};

/// Runs an [`Election`] for the lifetime of the host.
#[derive(Debug, Clone)]
pub struct Supervisor {
    election: Election,
    recampaign: bool,
    retry_interval: Duration,
    release_timeout: Duration,
}

impl Supervisor {
    pub fn new(election: Election, config: &ElectionConfig) -> Self {
        Self {
            election,
            recampaign: config.recampaign,
            retry_interval: config.retry_interval,
            release_timeout: config.release_timeout,
        }
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    /// Campaign until `shutdown` fires, then resign.
    ///
    /// Retryable campaign errors are retried after the retry interval; any
    /// other error ends the loop and is returned after resigning.
    pub async fn run(self, shutdown: CancellationToken) -> ElectionResult<()> {
        let campaign = CancellationToken::new();
        let result = self.campaign_loop(&campaign, &shutdown).await;
        self.shutdown().await;
        campaign.cancel();
        result
    }

    async fn campaign_loop(
        &self,
        campaign: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> ElectionResult<()> {
        let id = self.election.id();
        loop {
            let attempt = self.election.campaign(campaign.clone());
            tokio::pin!(attempt);
            let outcome = tokio::select! {
                res = &mut attempt => res,
                _ = shutdown.cancelled() => {
                    // let the pending attempt unwind through the driver
                    campaign.cancel();
                    let _ = attempt.await;
                    return Ok(());
                }
            };

            match outcome {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    warn!(election = %id, error = %err, retry_ms = self.retry_interval.as_millis(), "campaign failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_interval) => continue,
                    }
                }
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = self.election.wait_for_loss() => {}
            }
            if !self.recampaign {
                info!(election = %id, "leadership lost, not campaigning again");
                shutdown.cancelled().await;
                return Ok(());
            }
            info!(election = %id, "leadership lost, campaigning again");
        }
    }

    async fn shutdown(&self) {
        let id = self.election.id();
        let deadline = CancellationToken::new();
        let resign = self.election.resign(&deadline);
        tokio::pin!(resign);
        let res = tokio::select! {
            res = &mut resign => res,
            _ = tokio::time::sleep(self.release_timeout) => {
                deadline.cancel();
                resign.await
            }
        };
        match res {
            Ok(()) => debug!(election = %id, "supervisor stopped"),
            Err(ElectionError::Cancelled(_)) => warn!(
                election = %id,
                timeout_ms = self.release_timeout.as_millis(),
                "resign timed out on shutdown, relying on session expiry"
            ),
            Err(err) => warn!(election = %id, error = %err, "resign failed on shutdown"),
        }
    }
}
