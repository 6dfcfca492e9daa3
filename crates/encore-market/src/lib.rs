//! Async facade over the marketplace stores.
//!
//! Every call runs its SQLite work on the blocking pool. Events that change
//! review, proof or sale rows are followed by a trust refresh of the affected
//! seller, so the cached profile fields never drift from their source rows.

pub mod accounts;
pub mod listings;
pub mod messages;
pub mod reputation;

use std::sync::Arc;

use tracing::{error, warn};

use encore_db::Database;
use encore_types::{MarketError, MarketResult, TrustPolicy, UserId};

#[derive(Clone)]
pub struct Marketplace {
    inner: Arc<MarketInner>,
}

struct MarketInner {
    db: Database,
    policy: TrustPolicy,
}

impl Marketplace {
    pub fn new(db: Database, policy: TrustPolicy) -> Self {
        Self {
            inner: Arc::new(MarketInner { db, policy }),
        }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.inner.policy
    }

    /// Direct access to the store for synchronous callers such as tests and
    /// maintenance jobs.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Run blocking DB work off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> MarketResult<T>
    where
        F: FnOnce(&Database, &TrustPolicy) -> MarketResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner.db, &inner.policy))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                MarketError::unavailable("storage task aborted")
            })?
    }
}

/// Recompute trust for users touched by a write that already committed.
/// The write stands even if a refresh fails; the next refresh or the
/// maintenance reconcile repairs the cache.
fn refresh_after(db: &Database, policy: &TrustPolicy, users: &[UserId]) {
    for &user_id in users {
        if let Err(e) = db.refresh_trust(user_id, policy) {
            warn!(user_id = %user_id, "Trust refresh failed: {}", e);
        }
    }
}
