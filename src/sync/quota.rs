//! # Quota Guard
//!
//! Per-user and per-site ceilings on repositories added through user-owned
//! external services.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("reached maximum allowed user added repos: {limit}")]
    SiteLimitReached { limit: u64 },
    #[error("per user repo count has exceeded allowed limit: {limit}")]
    UserLimitExceeded { limit: u64 },
    #[error(
        "reached maximum allowed user added repos: site:{site}/{site_limit}, user:{user}/{user_limit}"
    )]
    InsertRejected {
        site: u64,
        site_limit: u64,
        user: u64,
        user_limit: u64,
    },
}

/// Ceilings applied to user-owned services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaGuard {
    max_per_user: u64,
    max_per_site: u64,
}

impl QuotaGuard {
    pub fn new(max_per_user: u64, max_per_site: u64) -> Self {
        Self {
            max_per_user,
            max_per_site,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.user_repos_max_per_user, config.user_repos_max_per_site)
    }

    pub fn max_per_user(&self) -> u64 {
        self.max_per_user
    }

    pub fn max_per_site(&self) -> u64 {
        self.max_per_site
    }

    /// Rejects a whole pass when the site already holds its ceiling of
    /// user-added repos.
    pub fn check_site(&self, site_added: u64) -> Result<(), QuotaError> {
        if site_added >= self.max_per_site {
            return Err(QuotaError::SiteLimitReached {
                limit: self.max_per_site,
            });
        }
        Ok(())
    }

    /// Rejects a single insertion when either ceiling is already reached.
    pub fn check_insert(&self, site_added: u64, user_added: u64) -> Result<(), QuotaError> {
        if site_added >= self.max_per_site || user_added >= self.max_per_user {
            return Err(QuotaError::InsertRejected {
                site: site_added,
                site_limit: self.max_per_site,
                user: user_added,
                user_limit: self.max_per_user,
            });
        }
        Ok(())
    }

    /// Counter for repos sourced from one user-owned service during a pass.
    pub fn sourced_counter(&self) -> RepoCounter {
        RepoCounter::new(self.max_per_user)
    }
}

/// Shared, lock-free counter with compare-and-increment semantics.
///
/// Clones share the same count, so concurrent producers can report into one
/// counter. Once `limit` is reached every further increment fails.
#[derive(Debug, Clone)]
pub struct RepoCounter {
    count: Arc<AtomicU64>,
    limit: u64,
}

impl RepoCounter {
    pub fn new(limit: u64) -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            limit,
        }
    }

    /// Increments the counter unless that would exceed the limit, returning
    /// the new count.
    pub fn try_increment(&self) -> Result<u64, QuotaError> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| QuotaError::UserLimitExceeded { limit: self.limit })
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn site_check_rejects_at_ceiling() {
        let guard = QuotaGuard::new(10, 100);
        assert!(guard.check_site(99).is_ok());
        assert_eq!(
            guard.check_site(100),
            Err(QuotaError::SiteLimitReached { limit: 100 })
        );
    }

    #[test]
    fn insert_check_reports_both_counts() {
        let guard = QuotaGuard::new(2, 100);
        assert!(guard.check_insert(5, 1).is_ok());

        let err = guard.check_insert(5, 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "reached maximum allowed user added repos: site:5/100, user:2/2"
        );
        assert!(guard.check_insert(100, 0).is_err());
    }

    #[test]
    fn counter_stops_at_limit() {
        let counter = QuotaGuard::new(2, 100).sourced_counter();
        assert_eq!(counter.try_increment(), Ok(1));
        assert_eq!(counter.try_increment(), Ok(2));
        assert_eq!(
            counter.try_increment(),
            Err(QuotaError::UserLimitExceeded { limit: 2 })
        );
        assert_eq!(counter.count(), 2);
    }

    #[test]
    fn counter_is_exact_under_contention() {
        let counter = RepoCounter::new(250);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || (0..100).filter(|_| counter.try_increment().is_ok()).count())
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 250);
        assert_eq!(counter.count(), 250);
    }
}
