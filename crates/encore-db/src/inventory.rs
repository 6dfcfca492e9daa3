use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use encore_types::api::{ListingUpdate, NewListing};
use encore_types::models::{Listing, PurchaseReceipt};
use encore_types::{ListingId, MarketError, MarketResult, TransactionToken, UserId};

use crate::Database;
use crate::identity::require_user;
use crate::models::{DATE_FORMAT, ListingRow, convert_all, now};
use crate::trust::{find_sale, record_sale_on};

impl Database {
    pub fn create_listing(&self, seller_id: UserId, details: &NewListing) -> MarketResult<ListingId> {
        details.validate()?;

        let id = ListingId::new();
        self.with_tx(|tx| {
            require_user(tx, seller_id)?;
            let ts = now();
            tx.execute(
                "INSERT INTO listings (id, seller_id, artist, concert_date, venue, section,
                     seat_row, seat, description, price_cents, quantity_available, is_available,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?12)",
                params![
                    id.to_string(),
                    seller_id.to_string(),
                    details.artist,
                    details.concert_date.format(DATE_FORMAT).to_string(),
                    details.venue,
                    details.section,
                    details.row,
                    details.seat,
                    details.description,
                    details.price_cents,
                    details.quantity,
                    ts,
                ],
            )?;
            Ok(())
        })?;

        info!(listing_id = %id, seller_id = %seller_id, quantity = details.quantity, "Listing created");
        Ok(id)
    }

    pub fn get_listing(&self, id: ListingId) -> MarketResult<Listing> {
        self.with_conn(|conn| query_listing(conn, id))
    }

    /// A seller's listings that can still be bought, soonest concert first.
    pub fn seller_listings(&self, seller_id: UserId) -> MarketResult<Vec<Listing>> {
        self.with_conn(|conn| {
            require_user(conn, seller_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM listings
                 WHERE seller_id = ?1 AND is_available = 1
                 ORDER BY concert_date ASC, created_at ASC",
                ListingRow::COLUMNS
            ))?;
            let rows = stmt
                .query_map([seller_id.to_string()], ListingRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            convert_all(rows)
        })
    }

    /// Take `amount` units off a listing and return what is left.
    ///
    /// Each attempt reads quantity and version, then updates only if the
    /// version is unchanged. Losing the race re-reads and tries again; running
    /// out of stock fails immediately with `InsufficientInventory`. Callers on
    /// different listings never contend with each other.
    pub fn decrement_availability(&self, id: ListingId, amount: i64) -> MarketResult<i64> {
        if amount <= 0 {
            return Err(MarketError::invalid("amount must be at least 1"));
        }

        let remaining = self.with_conn_mut(|conn| decrement_on(conn, id, amount))?;
        debug!(listing_id = %id, amount, remaining, "Inventory decremented");
        Ok(remaining)
    }

    /// Take a listing off the market regardless of remaining stock.
    pub fn withdraw_listing(&self, id: ListingId, seller_id: UserId) -> MarketResult<()> {
        self.with_tx(|tx| {
            let listing = query_listing(tx, id)?;
            if listing.seller_id != seller_id {
                return Err(MarketError::forbidden("only the seller can withdraw a listing"));
            }
            tx.execute(
                "UPDATE listings
                 SET withdrawn = 1, is_available = 0, version = version + 1, updated_at = ?1
                 WHERE id = ?2",
                params![now(), id.to_string()],
            )?;
            Ok(())
        })?;

        info!(listing_id = %id, "Listing withdrawn");
        Ok(())
    }

    /// Seller edits to price, stock or description. Availability follows the
    /// new quantity unless the listing was withdrawn.
    pub fn update_listing(
        &self,
        id: ListingId,
        seller_id: UserId,
        update: &ListingUpdate,
    ) -> MarketResult<Listing> {
        update.validate()?;

        self.with_tx(|tx| {
            let listing = query_listing(tx, id)?;
            if listing.seller_id != seller_id {
                return Err(MarketError::forbidden("only the seller can edit a listing"));
            }
            tx.execute(
                "UPDATE listings
                 SET price_cents = COALESCE(?1, price_cents),
                     quantity_available = COALESCE(?2, quantity_available),
                     description = COALESCE(?3, description),
                     is_available = (COALESCE(?2, quantity_available) > 0 AND withdrawn = 0),
                     version = version + 1,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    update.price_cents,
                    update.quantity,
                    update.description,
                    now(),
                    id.to_string()
                ],
            )?;
            query_listing(tx, id)
        })
    }

    /// Delete a listing. Messages, reviews and sale records that mention it
    /// are kept with the reference cleared.
    pub fn delete_listing(&self, id: ListingId, seller_id: UserId) -> MarketResult<()> {
        self.with_tx(|tx| {
            let listing = query_listing(tx, id)?;
            if listing.seller_id != seller_id {
                return Err(MarketError::forbidden("only the seller can delete a listing"));
            }
            let lid = id.to_string();
            tx.execute("UPDATE messages SET listing_id = NULL WHERE listing_id = ?1", [&lid])?;
            tx.execute("UPDATE reviews SET listing_id = NULL WHERE listing_id = ?1", [&lid])?;
            tx.execute("UPDATE sale_records SET listing_id = NULL WHERE listing_id = ?1", [&lid])?;
            tx.execute("DELETE FROM listings WHERE id = ?1", [&lid])?;
            Ok(())
        })?;

        info!(listing_id = %id, "Listing deleted");
        Ok(())
    }

    /// Buy `quantity` units: decrement stock, store the sale under the
    /// caller's token and bump the seller's sale count, all in one
    /// transaction. Replaying a token returns the stored receipt without
    /// touching inventory again.
    pub fn purchase(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        quantity: i64,
        token: &TransactionToken,
    ) -> MarketResult<PurchaseReceipt> {
        if quantity <= 0 {
            return Err(MarketError::invalid("quantity must be at least 1"));
        }

        let receipt = self.with_tx(|tx| {
            if let Some(sale) = find_sale(tx, token)? {
                if sale.buyer_id != Some(buyer_id)
                    || sale.listing_id.is_some_and(|l| l != listing_id)
                    || sale.quantity != quantity
                {
                    return Err(MarketError::invalid(format!(
                        "transaction token '{}' was used for a different purchase",
                        token
                    )));
                }
                return Ok(PurchaseReceipt {
                    token: token.clone(),
                    listing_id: sale.listing_id,
                    seller_id: sale.seller_id,
                    buyer_id,
                    quantity: sale.quantity,
                    remaining: sale.remaining.unwrap_or(0),
                    replayed: true,
                });
            }

            let listing = query_listing(tx, listing_id)?;
            require_user(tx, buyer_id)?;
            if listing.seller_id == buyer_id {
                return Err(MarketError::forbidden("sellers cannot buy their own listing"));
            }

            let remaining = decrement_on(tx, listing_id, quantity)?;
            record_sale_on(
                tx,
                token,
                listing.seller_id,
                Some(buyer_id),
                Some(listing_id),
                quantity,
                Some(remaining),
            )?;

            Ok(PurchaseReceipt {
                token: token.clone(),
                listing_id: Some(listing_id),
                seller_id: listing.seller_id,
                buyer_id,
                quantity,
                remaining,
                replayed: false,
            })
        })?;

        if receipt.replayed {
            debug!(token = %token, "Purchase replayed");
        } else {
            info!(
                listing_id = %listing_id,
                buyer_id = %buyer_id,
                quantity,
                remaining = receipt.remaining,
                "Purchase completed"
            );
        }
        Ok(receipt)
    }
}

/// Optimistic decrement on whichever connection or transaction is passed in.
pub(crate) fn decrement_on(conn: &Connection, id: ListingId, amount: i64) -> MarketResult<i64> {
    let lid = id.to_string();
    loop {
        let (quantity, version, withdrawn): (i64, i64, bool) = conn
            .query_row(
                "SELECT quantity_available, version, withdrawn FROM listings WHERE id = ?1",
                [&lid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| MarketError::not_found("listing", id))?;

        if withdrawn || amount > quantity {
            return Err(MarketError::InsufficientInventory {
                requested: amount,
                available: if withdrawn { 0 } else { quantity },
            });
        }

        // quantity and the availability flag change in the same statement
        let changed = conn.execute(
            "UPDATE listings
             SET quantity_available = quantity_available - ?1,
                 is_available = (quantity_available - ?1 > 0 AND withdrawn = 0),
                 version = version + 1,
                 updated_at = ?2
             WHERE id = ?3 AND version = ?4",
            params![amount, now(), lid, version],
        )?;

        if changed == 1 {
            return Ok(quantity - amount);
        }
        debug!(listing_id = %id, version, "Listing changed underneath decrement, retrying");
    }
}

pub(crate) fn query_listing(conn: &Connection, id: ListingId) -> MarketResult<Listing> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM listings WHERE id = ?1", ListingRow::COLUMNS),
            [id.to_string()],
            ListingRow::from_row,
        )
        .optional()?
        .ok_or_else(|| MarketError::not_found("listing", id))?;
    row.try_into()
}

pub(crate) fn require_listing(conn: &Connection, id: ListingId) -> MarketResult<()> {
    let found = conn
        .query_row("SELECT 1 FROM listings WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()?;
    found.ok_or_else(|| MarketError::not_found("listing", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{listing, new_listing, temp_db, user};

    #[test]
    fn create_listing_validates_input() {
        let db = temp_db();
        let seller = user(&db, "seller");

        let zero = db.create_listing(seller, &new_listing(0)).unwrap_err();
        assert!(matches!(zero, MarketError::InvalidArgument(_)));

        let mut negative = new_listing(1);
        negative.price_cents = -100;
        assert!(matches!(
            db.create_listing(seller, &negative),
            Err(MarketError::InvalidArgument(_))
        ));

        assert!(matches!(
            db.create_listing(UserId::new(), &new_listing(1)),
            Err(MarketError::NotFound { entity: "user", .. })
        ));
    }

    #[test]
    fn decrement_to_zero_flips_availability() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let id = listing(&db, seller, 3);

        assert_eq!(db.decrement_availability(id, 2).unwrap(), 1);
        let l = db.get_listing(id).unwrap();
        assert!(l.is_available);
        assert_eq!(l.version, 1);

        assert_eq!(db.decrement_availability(id, 1).unwrap(), 0);
        let l = db.get_listing(id).unwrap();
        assert_eq!(l.quantity_available, 0);
        assert!(!l.is_available);
    }

    #[test]
    fn oversell_is_rejected_without_changing_stock() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let id = listing(&db, seller, 2);

        let err = db.decrement_availability(id, 3).unwrap_err();
        assert_eq!(
            err,
            MarketError::InsufficientInventory {
                requested: 3,
                available: 2
            }
        );
        assert_eq!(db.get_listing(id).unwrap().quantity_available, 2);
    }

    #[test]
    fn decrement_rejects_non_positive_amounts_and_unknown_listings() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let id = listing(&db, seller, 2);

        assert!(matches!(
            db.decrement_availability(id, 0),
            Err(MarketError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.decrement_availability(ListingId::new(), 1),
            Err(MarketError::NotFound { .. })
        ));
    }

    #[test]
    fn withdraw_is_seller_only_and_blocks_purchases() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let stranger = user(&db, "stranger");
        let id = listing(&db, seller, 4);

        assert!(matches!(
            db.withdraw_listing(id, stranger),
            Err(MarketError::Forbidden(_))
        ));

        db.withdraw_listing(id, seller).unwrap();
        let l = db.get_listing(id).unwrap();
        assert!(!l.is_available);
        assert!(l.withdrawn);
        assert_eq!(l.quantity_available, 4);

        assert!(matches!(
            db.decrement_availability(id, 1),
            Err(MarketError::InsufficientInventory { available: 0, .. })
        ));
    }

    #[test]
    fn update_listing_recomputes_availability() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let id = listing(&db, seller, 1);
        db.decrement_availability(id, 1).unwrap();

        let restocked = db
            .update_listing(
                id,
                seller,
                &ListingUpdate {
                    quantity: Some(5),
                    price_cents: Some(9_900),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(restocked.is_available);
        assert_eq!(restocked.quantity_available, 5);
        assert_eq!(restocked.price_cents, 9_900);

        let stranger = user(&db, "stranger");
        assert!(matches!(
            db.update_listing(id, stranger, &ListingUpdate::default()),
            Err(MarketError::Forbidden(_))
        ));
    }

    #[test]
    fn delete_listing_keeps_messages_and_reviews() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let buyer = user(&db, "buyer");
        let id = listing(&db, seller, 1);
        let msg = db.send_message(buyer, seller, "hi", Some(id)).unwrap();
        db.submit_review(buyer, seller, Some(id), 5, None).unwrap();

        assert!(matches!(
            db.delete_listing(id, buyer),
            Err(MarketError::Forbidden(_))
        ));
        db.delete_listing(id, seller).unwrap();

        assert!(db.get_listing(id).is_err());
        assert_eq!(db.get_message(msg.id, seller).unwrap().listing_id, None);
        assert_eq!(db.reviews_for(seller, 0, 10).unwrap()[0].listing_id, None);
    }

    #[test]
    fn seller_listings_only_shows_available() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let open = listing(&db, seller, 2);
        let closed = listing(&db, seller, 1);
        db.withdraw_listing(closed, seller).unwrap();

        let listed: Vec<_> = db
            .seller_listings(seller)
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(listed, vec![open]);
    }

    #[test]
    fn purchase_counts_sale_and_is_idempotent() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let buyer = user(&db, "buyer");
        let id = listing(&db, seller, 3);
        let token = TransactionToken::new("order-1");

        let first = db.purchase(id, buyer, 2, &token).unwrap();
        assert!(!first.replayed);
        assert_eq!(first.remaining, 1);

        let again = db.purchase(id, buyer, 2, &token).unwrap();
        assert!(again.replayed);
        assert_eq!(again.remaining, 1);

        assert_eq!(db.get_listing(id).unwrap().quantity_available, 1);
        assert_eq!(db.get_profile(seller).unwrap().total_sales, 1);
    }

    #[test]
    fn purchase_rejects_own_listing_and_reused_tokens() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let buyer = user(&db, "buyer");
        let other = user(&db, "other");
        let id = listing(&db, seller, 3);

        assert!(matches!(
            db.purchase(id, seller, 1, &TransactionToken::new("t0")),
            Err(MarketError::Forbidden(_))
        ));

        let token = TransactionToken::new("t1");
        db.purchase(id, buyer, 1, &token).unwrap();
        assert!(matches!(
            db.purchase(id, other, 1, &token),
            Err(MarketError::InvalidArgument(_))
        ));
    }

    #[test]
    fn retry_with_a_different_quantity_is_rejected() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let buyer = user(&db, "buyer");
        let id = listing(&db, seller, 5);
        let token = TransactionToken::new("cart-7");

        db.purchase(id, buyer, 1, &token).unwrap();
        assert!(matches!(
            db.purchase(id, buyer, 3, &token),
            Err(MarketError::InvalidArgument(_))
        ));

        assert_eq!(db.get_listing(id).unwrap().quantity_available, 4);
        assert_eq!(db.get_profile(seller).unwrap().total_sales, 1);
    }

    #[test]
    fn failed_purchase_commits_nothing() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let buyer = user(&db, "buyer");
        let id = listing(&db, seller, 1);
        let token = TransactionToken::new("too-many");

        assert!(matches!(
            db.purchase(id, buyer, 2, &token),
            Err(MarketError::InsufficientInventory { .. })
        ));
        assert_eq!(db.get_profile(seller).unwrap().total_sales, 0);

        // the token was not burned by the failed attempt
        let ok = db.purchase(id, buyer, 1, &token).unwrap();
        assert!(!ok.replayed);
    }
}
