//! Shared types for the Encore marketplace core: identifiers, records, inputs,
//! configuration and the error taxonomy.

pub mod api;
pub mod config;
pub mod error;
pub mod ids;
pub mod models;

pub use config::{DbConfig, TrustPolicy};
pub use error::{MarketError, MarketResult};
pub use ids::{ListingId, MessageId, ProofId, ReviewId, TransactionToken, UserId};
