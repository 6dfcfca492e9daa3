use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use encore_types::api::ProfileUpdate;
use encore_types::models::{User, UserProfile};
use encore_types::{MarketError, MarketResult, UserId};

use crate::Database;
use crate::models::{ProfileRow, UserRow, convert_all, now};

impl Database {
    // -- Users --

    /// Create a user and their empty profile in one transaction.
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> MarketResult<UserId> {
        if username.trim().is_empty() {
            return Err(MarketError::invalid("username is required"));
        }
        if email.trim().is_empty() {
            return Err(MarketError::invalid("email is required"));
        }

        let id = UserId::new();
        self.with_tx(|tx| {
            let ts = now();
            tx.execute(
                "INSERT INTO users (id, username, email, password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id.to_string(), username, email, password_hash, ts],
            )?;
            tx.execute(
                "INSERT INTO user_profiles (user_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![id.to_string(), ts],
            )?;
            Ok(())
        })?;

        info!(user_id = %id, username, "User created");
        Ok(id)
    }

    pub fn get_user(&self, id: UserId) -> MarketResult<User> {
        self.with_conn(|conn| {
            query_user(conn, "id", &id.to_string())?.ok_or_else(|| MarketError::not_found("user", id))
        })
    }

    pub fn find_user_by_username(&self, username: &str) -> MarketResult<Option<User>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn find_user_by_email(&self, email: &str) -> MarketResult<Option<User>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    /// Record that the user's email address was confirmed upstream.
    pub fn mark_email_verified(&self, id: UserId) -> MarketResult<()> {
        let changed = self.with_conn_mut(|conn| {
            Ok(conn.execute(
                "UPDATE users SET is_verified = 1, updated_at = ?1 WHERE id = ?2",
                params![now(), id.to_string()],
            )?)
        })?;
        if changed == 0 {
            return Err(MarketError::not_found("user", id));
        }
        Ok(())
    }

    pub fn all_user_ids(&self) -> MarketResult<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users ORDER BY created_at")?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            raw.iter().map(|s| crate::models::parse_id(s)).collect()
        })
    }

    /// Delete a user and everything they own in one transaction.
    ///
    /// Listings owned by the user go away, but messages and reviews between
    /// *other* users that pointed at those listings survive with the listing
    /// reference cleared. Sales where the user was the buyer stay counted for
    /// the seller.
    ///
    /// Returns the users whose received reviews were removed, so their derived
    /// trust fields can be recomputed.
    pub fn delete_user(&self, id: UserId) -> MarketResult<Vec<UserId>> {
        let uid = id.to_string();
        let affected = self.with_tx(|tx| {
            if !user_exists(tx, id)? {
                return Err(MarketError::not_found("user", id));
            }

            let affected: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT reviewed_user_id FROM reviews
                     WHERE reviewer_id = ?1 AND reviewed_user_id != ?1",
                )?;
                stmt.query_map([&uid], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            let owned = "SELECT id FROM listings WHERE seller_id = ?1";
            tx.execute(
                &format!("UPDATE messages SET listing_id = NULL WHERE listing_id IN ({})", owned),
                [&uid],
            )?;
            tx.execute(
                &format!("UPDATE reviews SET listing_id = NULL WHERE listing_id IN ({})", owned),
                [&uid],
            )?;
            tx.execute(
                &format!("UPDATE sale_records SET listing_id = NULL WHERE listing_id IN ({})", owned),
                [&uid],
            )?;

            let messages = tx.execute(
                "DELETE FROM messages WHERE sender_id = ?1 OR receiver_id = ?1",
                [&uid],
            )?;
            let reviews = tx.execute(
                "DELETE FROM reviews WHERE reviewer_id = ?1 OR reviewed_user_id = ?1",
                [&uid],
            )?;
            let proofs = tx.execute("DELETE FROM seller_proofs WHERE seller_id = ?1", [&uid])?;
            tx.execute("UPDATE sale_records SET buyer_id = NULL WHERE buyer_id = ?1", [&uid])?;
            tx.execute("DELETE FROM sale_records WHERE seller_id = ?1", [&uid])?;
            let listings = tx.execute("DELETE FROM listings WHERE seller_id = ?1", [&uid])?;
            tx.execute("DELETE FROM user_profiles WHERE user_id = ?1", [&uid])?;
            tx.execute("DELETE FROM users WHERE id = ?1", [&uid])?;

            debug!(
                user_id = %id,
                listings, messages, reviews, proofs,
                "Cascade removed dependent rows"
            );
            Ok(affected)
        })?;

        info!(user_id = %id, "User deleted");
        affected.iter().map(|s| crate::models::parse_id(s)).collect()
    }

    // -- Profiles --

    pub fn get_profile(&self, user_id: UserId) -> MarketResult<UserProfile> {
        self.with_conn(|conn| query_profile(conn, user_id))
    }

    /// Update the user-editable profile fields. Seller stats are left alone.
    pub fn update_profile(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> MarketResult<UserProfile> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE user_profiles
                 SET bio = COALESCE(?1, bio),
                     picture_ref = COALESCE(?2, picture_ref),
                     updated_at = ?3
                 WHERE user_id = ?4",
                params![update.bio, update.picture_ref, now(), user_id.to_string()],
            )?;
            if changed == 0 {
                return Err(MarketError::not_found("profile", user_id));
            }
            query_profile(tx, user_id)
        })
    }

    /// Profiles for a batch of users, in no particular order.
    pub fn profiles(&self, ids: &[UserId]) -> MarketResult<Vec<UserProfile>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {} FROM user_profiles WHERE user_id IN ({})",
                ProfileRow::COLUMNS,
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let keys: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            let rows = stmt
                .query_map(rusqlite::params_from_iter(keys.iter()), ProfileRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            convert_all(rows)
        })
    }
}

pub(crate) fn user_exists(conn: &Connection, id: UserId) -> MarketResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id.to_string()], |_| Ok(()))
        .optional()?
        .is_some())
}

pub(crate) fn require_user(conn: &Connection, id: UserId) -> MarketResult<()> {
    if user_exists(conn, id)? {
        Ok(())
    } else {
        Err(MarketError::not_found("user", id))
    }
}

pub(crate) fn query_profile(conn: &Connection, user_id: UserId) -> MarketResult<UserProfile> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM user_profiles WHERE user_id = ?1",
                ProfileRow::COLUMNS
            ),
            [user_id.to_string()],
            ProfileRow::from_row,
        )
        .optional()?
        .ok_or_else(|| MarketError::not_found("profile", user_id))?;
    row.try_into()
}

fn query_user(conn: &Connection, column: &str, value: &str) -> MarketResult<Option<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE {} = ?1",
        UserRow::COLUMNS,
        column
    ))?;

    let row = stmt.query_row([value], UserRow::from_row).optional()?;
    row.map(User::try_from).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{listing, temp_db, user};

    #[test]
    fn create_user_creates_default_profile() {
        let db = temp_db();
        let id = user(&db, "alice");

        let profile = db.get_profile(id).unwrap();
        assert_eq!(profile.user_id, id);
        assert_eq!(profile.total_sales, 0);
        assert_eq!(profile.average_rating, 0.0);
        assert!(!profile.is_verified_seller);
        assert!(!db.get_user(id).unwrap().is_verified);
    }

    #[test]
    fn duplicate_username_or_email_is_rejected() {
        let db = temp_db();
        db.create_user("alice", "alice@example.com", "h").unwrap();

        let by_name = db.create_user("alice", "other@example.com", "h").unwrap_err();
        assert!(matches!(by_name, MarketError::DuplicateKey(_)));

        let by_email = db.create_user("alicia", "alice@example.com", "h").unwrap_err();
        assert!(matches!(by_email, MarketError::DuplicateKey(_)));

        // the failed inserts left no orphan profile behind
        assert_eq!(db.all_user_ids().unwrap().len(), 1);
    }

    #[test]
    fn lookups_by_username_and_email() {
        let db = temp_db();
        let id = user(&db, "bob");

        assert_eq!(db.find_user_by_username("bob").unwrap().unwrap().id, id);
        assert_eq!(
            db.find_user_by_email("bob@example.com").unwrap().unwrap().id,
            id
        );
        assert!(db.find_user_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn missing_profile_is_not_found() {
        let db = temp_db();
        let err = db.get_profile(UserId::new()).unwrap_err();
        assert!(matches!(err, MarketError::NotFound { entity: "profile", .. }));
    }

    #[test]
    fn email_verification_flag() {
        let db = temp_db();
        let id = user(&db, "carol");
        db.mark_email_verified(id).unwrap();
        assert!(db.get_user(id).unwrap().is_verified);

        assert!(db.mark_email_verified(UserId::new()).is_err());
    }

    #[test]
    fn profile_update_keeps_unset_fields() {
        let db = temp_db();
        let id = user(&db, "dave");

        db.update_profile(
            id,
            &ProfileUpdate {
                bio: Some("floor seats only".into()),
                picture_ref: Some("img/dave.png".into()),
            },
        )
        .unwrap();
        let profile = db
            .update_profile(
                id,
                &ProfileUpdate {
                    bio: Some("balcony is fine too".into()),
                    picture_ref: None,
                },
            )
            .unwrap();

        assert_eq!(profile.bio.as_deref(), Some("balcony is fine too"));
        assert_eq!(profile.picture_ref.as_deref(), Some("img/dave.png"));
    }

    #[test]
    fn delete_user_cascades_and_clears_listing_references() {
        let db = temp_db();
        let seller = user(&db, "seller");
        let buyer = user(&db, "buyer");
        let other = user(&db, "other");
        let gone = listing(&db, seller, 2);

        // conversation between two surviving users about the seller's listing
        let msg = db.send_message(buyer, other, "is this legit?", Some(gone)).unwrap();
        let review = db
            .submit_review(buyer, other, Some(gone), 4, None)
            .unwrap();
        db.send_message(buyer, seller, "still available?", Some(gone)).unwrap();
        db.record_sale_proof(seller, "proof/1.png", None).unwrap();

        db.delete_user(seller).unwrap();

        assert!(matches!(db.get_user(seller), Err(MarketError::NotFound { .. })));
        assert!(matches!(db.get_profile(seller), Err(MarketError::NotFound { .. })));
        assert!(matches!(db.get_listing(gone), Err(MarketError::NotFound { .. })));

        let kept = db.get_message(msg.id, buyer).unwrap();
        assert_eq!(kept.listing_id, None);
        let kept_review = db.reviews_for(other, 0, 10).unwrap();
        assert_eq!(kept_review.len(), 1);
        assert_eq!(kept_review[0].id, review.id);
        assert_eq!(kept_review[0].listing_id, None);

        // messages with the deleted user are gone
        assert_eq!(db.inbox(buyer, false, 0, 50).unwrap().len(), 1);
    }

    #[test]
    fn delete_user_reports_users_whose_reviews_changed() {
        let db = temp_db();
        let critic = user(&db, "critic");
        let seller = user(&db, "seller");
        db.submit_review(critic, seller, None, 1, Some("late".into())).unwrap();

        let affected = db.delete_user(critic).unwrap();
        assert_eq!(affected, vec![seller]);
        assert_eq!(db.compute_aggregate(seller).unwrap().review_count, 0);
    }

    #[test]
    fn deleting_unknown_user_is_not_found() {
        let db = temp_db();
        assert!(matches!(
            db.delete_user(UserId::new()),
            Err(MarketError::NotFound { entity: "user", .. })
        ));
    }
}
