use tracing::info;

use encore_types::models::{Review, ReviewAggregate, SellerProof, TrustSignal};
use encore_types::{ListingId, MarketResult, UserId};

use crate::{Marketplace, refresh_after};

impl Marketplace {
    pub async fn submit_review(
        &self,
        reviewer_id: UserId,
        reviewed_user_id: UserId,
        listing_id: Option<ListingId>,
        rating: u8,
        comment: Option<String>,
    ) -> MarketResult<Review> {
        self.blocking(move |db, policy| {
            let review = db.submit_review(reviewer_id, reviewed_user_id, listing_id, rating, comment)?;
            refresh_after(db, policy, &[reviewed_user_id]);
            Ok(review)
        })
        .await
    }

    pub async fn reviews_for(&self, user_id: UserId, offset: u32, limit: u32) -> MarketResult<Vec<Review>> {
        self.blocking(move |db, _| db.reviews_for(user_id, offset, limit.min(50)))
            .await
    }

    pub async fn record_sale_proof(
        &self,
        seller_id: UserId,
        image_ref: &str,
        description: Option<&str>,
    ) -> MarketResult<SellerProof> {
        let image_ref = image_ref.to_string();
        let description = description.map(str::to_string);
        self.blocking(move |db, policy| {
            let proof = db.record_sale_proof(seller_id, &image_ref, description.as_deref())?;
            refresh_after(db, policy, &[seller_id]);
            Ok(proof)
        })
        .await
    }

    pub async fn proofs_for(&self, seller_id: UserId) -> MarketResult<Vec<SellerProof>> {
        self.blocking(move |db, _| db.proofs_for(seller_id)).await
    }

    pub async fn compute_aggregate(&self, user_id: UserId) -> MarketResult<ReviewAggregate> {
        self.blocking(move |db, _| db.compute_aggregate(user_id)).await
    }

    /// The public seller reputation as currently stored.
    pub async fn trust_signal(&self, user_id: UserId) -> MarketResult<TrustSignal> {
        self.blocking(move |db, _| db.trust_signal(user_id)).await
    }

    pub async fn refresh_trust(&self, user_id: UserId) -> MarketResult<TrustSignal> {
        self.blocking(move |db, policy| db.refresh_trust(user_id, policy))
            .await
    }

    /// Count a sale completed outside [`Marketplace::purchase`]. Idempotent
    /// per token.
    pub async fn increment_sale_count(
        &self,
        seller_id: UserId,
        token: encore_types::TransactionToken,
    ) -> MarketResult<bool> {
        self.blocking(move |db, policy| {
            let counted = db.increment_sale_count(seller_id, &token)?;
            if counted {
                refresh_after(db, policy, &[seller_id]);
            }
            Ok(counted)
        })
        .await
    }

    /// Rebuild one user's sale count from stored sales and refresh trust.
    pub async fn reconcile(&self, user_id: UserId) -> MarketResult<TrustSignal> {
        self.blocking(move |db, policy| {
            db.reconcile_sales(user_id)?;
            db.refresh_trust(user_id, policy)
        })
        .await
    }

    /// Reconcile every user. Returns how many were processed.
    pub async fn reconcile_all(&self) -> MarketResult<usize> {
        self.blocking(|db, policy| {
            let users = db.all_user_ids()?;
            let mut verified = 0;
            for &user_id in &users {
                db.reconcile_sales(user_id)?;
                if db.refresh_trust(user_id, policy)?.is_verified_seller {
                    verified += 1;
                }
            }
            info!(users = users.len(), verified, "Reconciled trust for all users");
            Ok(users.len())
        })
        .await
    }
}
