use tracing::info;

use encore_types::api::ProfileUpdate;
use encore_types::models::{User, UserProfile};
use encore_types::{MarketResult, UserId};

use crate::{Marketplace, refresh_after};

impl Marketplace {
    /// Register an account. The password is hashed upstream; only the hash
    /// reaches the core.
    pub async fn register_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> MarketResult<UserId> {
        let (username, email, password_hash) =
            (username.to_string(), email.to_string(), password_hash.to_string());
        self.blocking(move |db, _| db.create_user(&username, &email, &password_hash))
            .await
    }

    /// Remove an account and everything it owns, then recompute trust for
    /// sellers that lost reviews written by this user.
    pub async fn delete_user(&self, user_id: UserId) -> MarketResult<()> {
        self.blocking(move |db, policy| {
            let affected = db.delete_user(user_id)?;
            if !affected.is_empty() {
                info!(user_id = %user_id, sellers = affected.len(), "Refreshing trust after account deletion");
            }
            refresh_after(db, policy, &affected);
            Ok(())
        })
        .await
    }

    pub async fn user(&self, user_id: UserId) -> MarketResult<User> {
        self.blocking(move |db, _| db.get_user(user_id)).await
    }

    pub async fn user_by_username(&self, username: &str) -> MarketResult<Option<User>> {
        let username = username.to_string();
        self.blocking(move |db, _| db.find_user_by_username(&username))
            .await
    }

    pub async fn user_by_email(&self, email: &str) -> MarketResult<Option<User>> {
        let email = email.to_string();
        self.blocking(move |db, _| db.find_user_by_email(&email)).await
    }

    pub async fn mark_email_verified(&self, user_id: UserId) -> MarketResult<()> {
        self.blocking(move |db, _| db.mark_email_verified(user_id))
            .await
    }

    pub async fn profile(&self, user_id: UserId) -> MarketResult<UserProfile> {
        self.blocking(move |db, _| db.get_profile(user_id)).await
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        update: ProfileUpdate,
    ) -> MarketResult<UserProfile> {
        self.blocking(move |db, _| db.update_profile(user_id, &update))
            .await
    }
}

#[cfg(test)]
mod tests {
    use encore_types::{MarketError, TrustPolicy};

    use crate::test_support::{market, tickets, user};

    #[tokio::test]
    async fn registration_and_lookup() {
        let market = market(TrustPolicy::default());
        let id = user(&market, "maya").await;

        assert_eq!(market.user(id).await.unwrap().username, "maya");
        assert_eq!(
            market.user_by_email("maya@example.com").await.unwrap().unwrap().id,
            id
        );
        assert!(matches!(
            market.register_user("maya", "x@example.com", "h").await,
            Err(MarketError::DuplicateKey(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_reviewer_refreshes_the_seller() {
        let market = market(TrustPolicy::default());
        let seller = user(&market, "seller").await;
        let critic = user(&market, "critic").await;
        let fan = user(&market, "fan").await;
        market.submit_review(critic, seller, None, 1, None).await.unwrap();
        market.submit_review(fan, seller, None, 5, None).await.unwrap();
        assert_eq!(market.profile(seller).await.unwrap().average_rating, 3.0);

        market.delete_user(critic).await.unwrap();
        assert_eq!(market.profile(seller).await.unwrap().average_rating, 5.0);
    }

    #[tokio::test]
    async fn deleting_a_seller_keeps_buyer_conversations() {
        let market = market(TrustPolicy::default());
        let seller = user(&market, "seller").await;
        let buyer = user(&market, "buyer").await;
        let friend = user(&market, "friend").await;
        let listing = market.create_listing(seller, tickets(2)).await.unwrap();
        let msg = market
            .send_message(buyer, friend, "want to go?", Some(listing))
            .await
            .unwrap();

        market.delete_user(seller).await.unwrap();

        assert!(market.listing(listing).await.is_err());
        let kept = market.message(msg.id, friend).await.unwrap();
        assert_eq!(kept.listing_id, None);
    }
}
