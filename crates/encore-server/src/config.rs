use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use encore_types::{DbConfig, TrustPolicy};

/// Everything the `encore` binary reads from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub trust: TrustPolicy,
    /// `None` runs a single reconcile pass and exits.
    pub reconcile_every: Option<Duration>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let db_defaults = DbConfig::default();
        let trust_defaults = TrustPolicy::default();

        let db = DbConfig {
            path: lookup("ENCORE_DB_PATH").unwrap_or(db_defaults.path),
            writers: parse_or(&lookup, "ENCORE_DB_WRITERS", db_defaults.writers)?,
            readers: parse_or(&lookup, "ENCORE_DB_READERS", db_defaults.readers)?,
            busy_timeout_ms: parse_or(&lookup, "ENCORE_DB_BUSY_TIMEOUT_MS", db_defaults.busy_timeout_ms)?,
        };
        if db.writers == 0 || db.readers == 0 {
            bail!("ENCORE_DB_WRITERS and ENCORE_DB_READERS must be at least 1");
        }

        let trust = TrustPolicy {
            min_sales: parse_or(&lookup, "ENCORE_TRUST_MIN_SALES", trust_defaults.min_sales)?,
            min_rating: parse_or(&lookup, "ENCORE_TRUST_MIN_RATING", trust_defaults.min_rating)?,
            min_proofs: parse_or(&lookup, "ENCORE_TRUST_MIN_PROOFS", trust_defaults.min_proofs)?,
        };
        if !(1.0..=5.0).contains(&trust.min_rating) {
            bail!("ENCORE_TRUST_MIN_RATING must be between 1 and 5, got {}", trust.min_rating);
        }

        let reconcile_every = match lookup("ENCORE_RECONCILE_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("ENCORE_RECONCILE_INTERVAL_SECS={:?} is not a number", raw))?;
                if secs == 0 {
                    bail!("ENCORE_RECONCILE_INTERVAL_SECS must be positive");
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            db,
            trust,
            reconcile_every,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{}={:?} is not valid", key, raw)),
        None => Ok(default),
    }
}
