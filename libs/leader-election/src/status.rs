//! Process-local leadership flag.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Whether this process currently holds leadership.
///
/// Cloning is cheap and every clone observes the same flag, so request
/// handlers can keep a `Status` without holding on to the [`Election`].
/// Only the election's transition logic writes it.
///
/// [`Election`]: crate::Election
#[derive(Debug, Clone, Default)]
pub struct Status {
    is_leader: Arc<AtomicBool>,
}

impl Status {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the most recently completed leadership transition. Never blocks.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_defaults_to_follower() {
        let status = Status::new();
        assert!(!status.is_leader());
    }

    #[test]
    fn test_status_clones_share_flag() {
        let status = Status::new();
        let reader = status.clone();
        status.set(true);
        assert!(reader.is_leader());
        status.set(false);
        assert!(!reader.is_leader());
    }

    #[tokio::test]
    async fn test_status_readable_across_tasks() {
        let status = Status::new();
        status.set(true);
        let readers = (0..8)
            .map(|_| {
                let status = status.clone();
                tokio::spawn(async move { status.is_leader() })
            })
            .collect::<Vec<_>>();
        for reader in readers {
            assert!(reader.await.unwrap());
        }
    }
}
