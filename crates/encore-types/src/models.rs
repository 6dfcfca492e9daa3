use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ListingId, MessageId, ProofId, ReviewId, TransactionToken, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Opaque to the core; hashed and verified upstream.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Email verification flag.
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One-to-one with [`User`]. The seller stats are a cache of review, proof
/// and sale rows and are only written by the trust refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub bio: Option<String>,
    pub picture_ref: Option<String>,
    pub total_sales: i64,
    pub is_verified_seller: bool,
    pub average_rating: f64,
    /// Review and proof counts as of the last refresh, in step with
    /// `average_rating`.
    pub review_count: i64,
    pub proof_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub seller_id: UserId,
    pub artist: String,
    pub concert_date: NaiveDate,
    pub venue: String,
    pub section: Option<String>,
    pub row: Option<String>,
    pub seat: Option<String>,
    pub description: Option<String>,
    /// Fixed-point price in cents.
    pub price_cents: i64,
    pub quantity_available: i64,
    /// `quantity_available > 0 && !withdrawn`, kept in the row so readers
    /// never see the two out of step.
    pub is_available: bool,
    pub withdrawn: bool,
    /// Bumped on every mutation; the decrement compares against it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Cleared when the listing is deleted; the message survives.
    pub listing_id: Option<ListingId>,
    pub text: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub reviewer_id: UserId,
    pub reviewed_user_id: UserId,
    pub listing_id: Option<ListingId>,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerProof {
    pub id: ProofId,
    pub seller_id: UserId,
    pub image_ref: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a user's review and proof rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReviewAggregate {
    pub average_rating: f64,
    pub review_count: i64,
    pub proof_count: i64,
}

impl ReviewAggregate {
    pub const EMPTY: Self = Self {
        average_rating: 0.0,
        review_count: 0,
        proof_count: 0,
    };
}

/// Public seller reputation shown next to listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSignal {
    pub user_id: UserId,
    pub average_rating: f64,
    pub review_count: i64,
    pub proof_count: i64,
    pub total_sales: i64,
    pub is_verified_seller: bool,
}

/// Result of a purchase attempt. `replayed` is set when the transaction token
/// had already been applied and nothing changed this time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub token: TransactionToken,
    pub listing_id: Option<ListingId>,
    pub seller_id: UserId,
    pub buyer_id: UserId,
    pub quantity: i64,
    pub remaining: i64,
    pub replayed: bool,
}

/// Inbox row: one per counterpart the user has exchanged messages with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub counterpart_id: UserId,
    pub counterpart_username: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i64,
}
