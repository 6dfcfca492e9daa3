use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use encore_types::models::{ReviewAggregate, TrustSignal};
use encore_types::{ListingId, MarketError, MarketResult, TransactionToken, TrustPolicy, UserId};

use crate::Database;
use crate::identity::query_profile;
use crate::models::{SaleRow, now, parse_id};
use crate::reviews::aggregate_on;

/// A sale already recorded under some transaction token.
#[derive(Debug, Clone)]
pub(crate) struct StoredSale {
    pub seller_id: UserId,
    pub buyer_id: Option<UserId>,
    pub listing_id: Option<ListingId>,
    pub quantity: i64,
    pub remaining: Option<i64>,
}

impl Database {
    /// Recompute the derived profile fields from the current review, proof
    /// and sale rows and store them. Reads and write share one transaction,
    /// so the average never reflects a half-applied review insert.
    pub fn refresh_trust(&self, user_id: UserId, policy: &TrustPolicy) -> MarketResult<TrustSignal> {
        let signal = self.with_tx(|tx| {
            let profile = query_profile(tx, user_id)?;
            let aggregate = aggregate_on(tx, user_id)?;
            let verified = policy.is_verified_seller(&aggregate, profile.total_sales);

            tx.execute(
                "UPDATE user_profiles
                 SET average_rating = ?1, review_count = ?2, proof_count = ?3,
                     is_verified_seller = ?4, updated_at = ?5
                 WHERE user_id = ?6",
                params![
                    aggregate.average_rating,
                    aggregate.review_count,
                    aggregate.proof_count,
                    verified,
                    now(),
                    user_id.to_string()
                ],
            )?;

            if verified != profile.is_verified_seller {
                info!(user_id = %user_id, verified, "Verified-seller badge changed");
            }
            Ok(signal_from(user_id, &aggregate, profile.total_sales, verified))
        })?;

        debug!(
            user_id = %user_id,
            average_rating = signal.average_rating,
            total_sales = signal.total_sales,
            "Trust refreshed"
        );
        Ok(signal)
    }

    /// The stored trust signal, as last computed by [`Database::refresh_trust`].
    /// Every field comes from the profile row, so the average always matches
    /// the counts shown next to it.
    pub fn trust_signal(&self, user_id: UserId) -> MarketResult<TrustSignal> {
        let profile = self.with_conn(|conn| query_profile(conn, user_id))?;
        Ok(TrustSignal {
            user_id,
            average_rating: profile.average_rating,
            review_count: profile.review_count,
            proof_count: profile.proof_count,
            total_sales: profile.total_sales,
            is_verified_seller: profile.is_verified_seller,
        })
    }

    /// Count one completed sale for `seller_id`. Returns `false` when the
    /// token was already counted.
    pub fn increment_sale_count(
        &self,
        seller_id: UserId,
        token: &TransactionToken,
    ) -> MarketResult<bool> {
        let counted = self.with_tx(|tx| {
            // profile must exist before the sale is stored
            query_profile(tx, seller_id)?;
            if let Some(sale) = find_sale(tx, token)? {
                if sale.seller_id != seller_id {
                    return Err(MarketError::invalid(format!(
                        "transaction token '{}' was already counted for another seller",
                        token
                    )));
                }
                return Ok(false);
            }
            record_sale_on(tx, token, seller_id, None, None, 1, None)?;
            Ok(true)
        })?;

        if counted {
            debug!(user_id = %seller_id, token = %token, "Sale counted");
        }
        Ok(counted)
    }

    /// Reset `total_sales` to the number of stored sale records. This is the
    /// only path that may lower the counter.
    pub fn reconcile_sales(&self, seller_id: UserId) -> MarketResult<i64> {
        self.with_tx(|tx| {
            let before = query_profile(tx, seller_id)?.total_sales;
            let actual: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sale_records WHERE seller_id = ?1",
                [seller_id.to_string()],
                |r| r.get(0),
            )?;
            if actual != before {
                tx.execute(
                    "UPDATE user_profiles SET total_sales = ?1, updated_at = ?2 WHERE user_id = ?3",
                    params![actual, now(), seller_id.to_string()],
                )?;
                info!(user_id = %seller_id, before, after = actual, "Sale count reconciled");
            }
            Ok(actual)
        })
    }
}

fn signal_from(
    user_id: UserId,
    aggregate: &ReviewAggregate,
    total_sales: i64,
    verified: bool,
) -> TrustSignal {
    TrustSignal {
        user_id,
        average_rating: aggregate.average_rating,
        review_count: aggregate.review_count,
        proof_count: aggregate.proof_count,
        total_sales,
        is_verified_seller: verified,
    }
}

pub(crate) fn find_sale(conn: &Connection, token: &TransactionToken) -> MarketResult<Option<StoredSale>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM sale_records WHERE token = ?1", SaleRow::COLUMNS),
            [token.as_str()],
            SaleRow::from_row,
        )
        .optional()?;

    row.map(|r| {
        Ok(StoredSale {
            seller_id: parse_id(&r.seller_id)?,
            buyer_id: r.buyer_id.as_deref().map(parse_id).transpose()?,
            listing_id: r.listing_id.as_deref().map(parse_id).transpose()?,
            quantity: r.quantity,
            remaining: r.remaining,
        })
    })
    .transpose()
}

/// Store the sale and bump the seller's counter. Must run inside the caller's
/// transaction so the two stay in step.
pub(crate) fn record_sale_on(
    conn: &Connection,
    token: &TransactionToken,
    seller_id: UserId,
    buyer_id: Option<UserId>,
    listing_id: Option<ListingId>,
    quantity: i64,
    remaining: Option<i64>,
) -> MarketResult<()> {
    conn.execute(
        "INSERT INTO sale_records (token, seller_id, buyer_id, listing_id, quantity, remaining, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            token.as_str(),
            seller_id.to_string(),
            buyer_id.map(|id| id.to_string()),
            listing_id.map(|id| id.to_string()),
            quantity,
            remaining,
            now(),
        ],
    )?;
    conn.execute(
        "UPDATE user_profiles SET total_sales = total_sales + 1, updated_at = ?1 WHERE user_id = ?2",
        params![now(), seller_id.to_string()],
    )?;
    Ok(())
}
