use rusqlite::{Connection, params};
use tracing::info;

use encore_types::models::{Review, ReviewAggregate, SellerProof};
use encore_types::{ListingId, MarketError, MarketResult, ProofId, ReviewId, UserId};

use crate::Database;
use crate::identity::require_user;
use crate::inventory::require_listing;
use crate::models::{ProofRow, ReviewRow, convert_all, now, parse_ts};

impl Database {
    // -- Reviews --

    pub fn submit_review(
        &self,
        reviewer_id: UserId,
        reviewed_user_id: UserId,
        listing_id: Option<ListingId>,
        rating: u8,
        comment: Option<String>,
    ) -> MarketResult<Review> {
        if !(1..=5).contains(&rating) {
            return Err(MarketError::invalid(format!(
                "rating must be between 1 and 5, got {}",
                rating
            )));
        }
        if reviewer_id == reviewed_user_id {
            return Err(MarketError::SelfReview);
        }

        let id = ReviewId::new();
        let created_at = self.with_tx(|tx| {
            require_user(tx, reviewer_id)?;
            require_user(tx, reviewed_user_id)?;
            if let Some(listing_id) = listing_id {
                require_listing(tx, listing_id)?;
            }

            let ts = now();
            tx.execute(
                "INSERT INTO reviews (id, reviewer_id, reviewed_user_id, listing_id, rating, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    reviewer_id.to_string(),
                    reviewed_user_id.to_string(),
                    listing_id.map(|l| l.to_string()),
                    rating,
                    comment,
                    ts,
                ],
            )?;
            Ok(ts)
        })?;

        info!(review_id = %id, reviewed_user_id = %reviewed_user_id, rating, "Review submitted");
        Ok(Review {
            id,
            reviewer_id,
            reviewed_user_id,
            listing_id,
            rating,
            comment,
            created_at: parse_ts(&created_at)?,
        })
    }

    /// Reviews a user has received, newest first.
    pub fn reviews_for(&self, user_id: UserId, offset: u32, limit: u32) -> MarketResult<Vec<Review>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM reviews WHERE reviewed_user_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2 OFFSET ?3",
                ReviewRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![user_id.to_string(), limit, offset], ReviewRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            convert_all(rows)
        })
    }

    // -- Seller proof --

    /// Store a reference to an already uploaded proof-of-sale image.
    pub fn record_sale_proof(
        &self,
        seller_id: UserId,
        image_ref: &str,
        description: Option<&str>,
    ) -> MarketResult<SellerProof> {
        if image_ref.trim().is_empty() {
            return Err(MarketError::invalid("proof image reference is required"));
        }

        let id = ProofId::new();
        let created_at = self.with_tx(|tx| {
            require_user(tx, seller_id)?;
            let ts = now();
            tx.execute(
                "INSERT INTO seller_proofs (id, seller_id, image_ref, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), seller_id.to_string(), image_ref, description, ts],
            )?;
            Ok(ts)
        })?;

        info!(proof_id = %id, seller_id = %seller_id, "Sale proof recorded");
        Ok(SellerProof {
            id,
            seller_id,
            image_ref: image_ref.to_string(),
            description: description.map(str::to_string),
            created_at: parse_ts(&created_at)?,
        })
    }

    pub fn proofs_for(&self, seller_id: UserId) -> MarketResult<Vec<SellerProof>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM seller_proofs WHERE seller_id = ?1 ORDER BY created_at DESC",
                ProofRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map([seller_id.to_string()], ProofRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            convert_all(rows)
        })
    }

    // -- Aggregation --

    /// Mean rating and proof count from one consistent snapshot of the rows.
    pub fn compute_aggregate(&self, user_id: UserId) -> MarketResult<ReviewAggregate> {
        self.with_snapshot(|tx| {
            require_user(tx, user_id)?;
            aggregate_on(tx, user_id)
        })
    }
}

pub(crate) fn aggregate_on(conn: &Connection, user_id: UserId) -> MarketResult<ReviewAggregate> {
    let uid = user_id.to_string();
    let (average, review_count): (Option<f64>, i64) = conn.query_row(
        "SELECT AVG(rating), COUNT(*) FROM reviews WHERE reviewed_user_id = ?1",
        [&uid],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let proof_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM seller_proofs WHERE seller_id = ?1",
        [&uid],
        |r| r.get(0),
    )?;

    Ok(ReviewAggregate {
        average_rating: average.unwrap_or(0.0),
        review_count,
        proof_count,
    })
}
