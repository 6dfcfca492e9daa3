use tracing::info;

use encore_types::api::{ListingUpdate, NewListing};
use encore_types::models::{Listing, PurchaseReceipt};
use encore_types::{ListingId, MarketResult, TransactionToken, UserId};

use crate::{Marketplace, refresh_after};

impl Marketplace {
    pub async fn create_listing(&self, seller_id: UserId, details: NewListing) -> MarketResult<ListingId> {
        self.blocking(move |db, _| db.create_listing(seller_id, &details))
            .await
    }

    pub async fn listing(&self, listing_id: ListingId) -> MarketResult<Listing> {
        self.blocking(move |db, _| db.get_listing(listing_id)).await
    }

    pub async fn seller_listings(&self, seller_id: UserId) -> MarketResult<Vec<Listing>> {
        self.blocking(move |db, _| db.seller_listings(seller_id)).await
    }

    pub async fn update_listing(
        &self,
        listing_id: ListingId,
        seller_id: UserId,
        update: ListingUpdate,
    ) -> MarketResult<Listing> {
        self.blocking(move |db, _| db.update_listing(listing_id, seller_id, &update))
            .await
    }

    pub async fn withdraw_listing(&self, listing_id: ListingId, seller_id: UserId) -> MarketResult<()> {
        self.blocking(move |db, _| db.withdraw_listing(listing_id, seller_id))
            .await
    }

    pub async fn delete_listing(&self, listing_id: ListingId, seller_id: UserId) -> MarketResult<()> {
        self.blocking(move |db, _| db.delete_listing(listing_id, seller_id))
            .await
    }

    /// Buy tickets. Fails fast with `InsufficientInventory` when stock ran
    /// out; the core never retries on its own. Retrying with the same token
    /// is safe and returns the original receipt.
    pub async fn purchase(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        quantity: i64,
        token: TransactionToken,
    ) -> MarketResult<PurchaseReceipt> {
        self.blocking(move |db, policy| {
            let receipt = db.purchase(listing_id, buyer_id, quantity, &token)?;
            // also on replay, so a retry heals a refresh that failed last time
            refresh_after(db, policy, &[receipt.seller_id]);
            if receipt.remaining == 0 && !receipt.replayed {
                info!(listing_id = %listing_id, "Listing sold out");
            }
            Ok(receipt)
        })
        .await
    }
}
