use serde::{Deserialize, Serialize};

use crate::models::ReviewAggregate;

/// Thresholds for the verified-seller badge. Operators tune these to change
/// fraud sensitivity; nothing in the schema depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    /// `total_sales` must be strictly greater than this.
    pub min_sales: i64,
    /// Average rating must be at or above this.
    pub min_rating: f64,
    /// Number of sale-proof records required.
    pub min_proofs: i64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            min_sales: 5,
            min_rating: 4.5,
            min_proofs: 1,
        }
    }
}

impl TrustPolicy {
    pub fn is_verified_seller(&self, aggregate: &ReviewAggregate, total_sales: i64) -> bool {
        aggregate.proof_count >= self.min_proofs.max(1)
            && total_sales > self.min_sales
            && aggregate.average_rating >= self.min_rating
    }
}

/// Connection pool sizing for the SQLite store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: String,
    pub writers: usize,
    pub readers: usize,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: "encore.db".into(),
            writers: 4,
            readers: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(average_rating: f64, proof_count: i64) -> ReviewAggregate {
        ReviewAggregate {
            average_rating,
            review_count: 4,
            proof_count,
        }
    }

    #[test]
    fn badge_needs_every_threshold() {
        let policy = TrustPolicy::default();
        assert!(policy.is_verified_seller(&aggregate(4.5, 1), 6));
        assert!(!policy.is_verified_seller(&aggregate(4.5, 0), 6));
        assert!(!policy.is_verified_seller(&aggregate(4.5, 1), 5));
        assert!(!policy.is_verified_seller(&aggregate(4.4, 1), 6));
    }

    #[test]
    fn at_least_one_proof_even_if_configured_lower() {
        let policy = TrustPolicy {
            min_proofs: 0,
            ..Default::default()
        };
        assert!(!policy.is_verified_seller(&aggregate(5.0, 0), 100));
    }

    #[test]
    fn partial_policy_fills_defaults() {
        let policy: TrustPolicy = serde_json::from_str(r#"{"min_sales": 10}"#).unwrap();
        assert_eq!(policy.min_sales, 10);
        assert_eq!(policy.min_rating, 4.5);
    }
}
