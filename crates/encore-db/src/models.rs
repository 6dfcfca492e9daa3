//! Database row types. These map directly to SQLite rows and are converted to
//! the `encore-types` records at the store boundary, where ids and timestamps
//! get parsed.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Row;

use encore_types::models::{Listing, Message, Review, SellerProof, User, UserProfile};
use encore_types::{MarketError, MarketResult};

/// Timestamps are stored as fixed-width RFC 3339 strings with microseconds so
/// that text ordering matches time ordering.
pub(crate) fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> MarketResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MarketError::Internal(format!("corrupt timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_id<T>(raw: &str) -> MarketResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| MarketError::Internal(format!("corrupt id '{}': {}", raw, e)))
}

fn parse_opt_id<T>(raw: Option<&str>) -> MarketResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(parse_id).transpose()
}

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_verified: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl UserRow {
    pub const COLUMNS: &'static str =
        "id, username, email, password_hash, is_verified, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            is_verified: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

impl TryFrom<UserRow> for User {
    type Error = MarketError;

    fn try_from(row: UserRow) -> MarketResult<Self> {
        Ok(User {
            id: parse_id(&row.id)?,
            username: row.username,
            email: row.email,
            password_hash: row.password_hash,
            is_verified: row.is_verified,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

pub struct ProfileRow {
    pub user_id: String,
    pub bio: Option<String>,
    pub picture_ref: Option<String>,
    pub total_sales: i64,
    pub is_verified_seller: bool,
    pub average_rating: f64,
    pub review_count: i64,
    pub proof_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ProfileRow {
    pub const COLUMNS: &'static str = "user_id, bio, picture_ref, total_sales, is_verified_seller, \
         average_rating, review_count, proof_count, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            bio: row.get(1)?,
            picture_ref: row.get(2)?,
            total_sales: row.get(3)?,
            is_verified_seller: row.get(4)?,
            average_rating: row.get(5)?,
            review_count: row.get(6)?,
            proof_count: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

impl TryFrom<ProfileRow> for UserProfile {
    type Error = MarketError;

    fn try_from(row: ProfileRow) -> MarketResult<Self> {
        Ok(UserProfile {
            user_id: parse_id(&row.user_id)?,
            bio: row.bio,
            picture_ref: row.picture_ref,
            total_sales: row.total_sales,
            is_verified_seller: row.is_verified_seller,
            average_rating: row.average_rating,
            review_count: row.review_count,
            proof_count: row.proof_count,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

pub struct ListingRow {
    pub id: String,
    pub seller_id: String,
    pub artist: String,
    pub concert_date: String,
    pub venue: String,
    pub section: Option<String>,
    pub seat_row: Option<String>,
    pub seat: Option<String>,
    pub description: Option<String>,
    pub price_cents: i64,
    pub quantity_available: i64,
    pub is_available: bool,
    pub withdrawn: bool,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ListingRow {
    pub const COLUMNS: &'static str = "id, seller_id, artist, concert_date, venue, section, seat_row, \
         seat, description, price_cents, quantity_available, is_available, withdrawn, version, \
         created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seller_id: row.get(1)?,
            artist: row.get(2)?,
            concert_date: row.get(3)?,
            venue: row.get(4)?,
            section: row.get(5)?,
            seat_row: row.get(6)?,
            seat: row.get(7)?,
            description: row.get(8)?,
            price_cents: row.get(9)?,
            quantity_available: row.get(10)?,
            is_available: row.get(11)?,
            withdrawn: row.get(12)?,
            version: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}

impl TryFrom<ListingRow> for Listing {
    type Error = MarketError;

    fn try_from(row: ListingRow) -> MarketResult<Self> {
        let concert_date = NaiveDate::parse_from_str(&row.concert_date, DATE_FORMAT)
            .map_err(|e| {
                MarketError::Internal(format!("corrupt concert_date on listing '{}': {}", row.id, e))
            })?;
        Ok(Listing {
            id: parse_id(&row.id)?,
            seller_id: parse_id(&row.seller_id)?,
            artist: row.artist,
            concert_date,
            venue: row.venue,
            section: row.section,
            row: row.seat_row,
            seat: row.seat,
            description: row.description,
            price_cents: row.price_cents,
            quantity_available: row.quantity_available,
            is_available: row.is_available,
            withdrawn: row.withdrawn,
            version: row.version,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub listing_id: Option<String>,
    pub body: String,
    pub is_read: bool,
    pub created_at: String,
}

impl MessageRow {
    /// `rowid` breaks ties between messages stored in the same microsecond.
    pub const COLUMNS: &'static str =
        "rowid, id, sender_id, receiver_id, listing_id, body, is_read, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            sender_id: row.get(2)?,
            receiver_id: row.get(3)?,
            listing_id: row.get(4)?,
            body: row.get(5)?,
            is_read: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = MarketError;

    fn try_from(row: MessageRow) -> MarketResult<Self> {
        Ok(Message {
            id: parse_id(&row.id)?,
            sender_id: parse_id(&row.sender_id)?,
            receiver_id: parse_id(&row.receiver_id)?,
            listing_id: parse_opt_id(row.listing_id.as_deref())?,
            text: row.body,
            is_read: row.is_read,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

pub struct ReviewRow {
    pub id: String,
    pub reviewer_id: String,
    pub reviewed_user_id: String,
    pub listing_id: Option<String>,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: String,
}

impl ReviewRow {
    pub const COLUMNS: &'static str =
        "id, reviewer_id, reviewed_user_id, listing_id, rating, comment, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            reviewer_id: row.get(1)?,
            reviewed_user_id: row.get(2)?,
            listing_id: row.get(3)?,
            rating: row.get(4)?,
            comment: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl TryFrom<ReviewRow> for Review {
    type Error = MarketError;

    fn try_from(row: ReviewRow) -> MarketResult<Self> {
        Ok(Review {
            id: parse_id(&row.id)?,
            reviewer_id: parse_id(&row.reviewer_id)?,
            reviewed_user_id: parse_id(&row.reviewed_user_id)?,
            listing_id: parse_opt_id(row.listing_id.as_deref())?,
            rating: row.rating,
            comment: row.comment,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

pub struct ProofRow {
    pub id: String,
    pub seller_id: String,
    pub image_ref: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl ProofRow {
    pub const COLUMNS: &'static str = "id, seller_id, image_ref, description, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seller_id: row.get(1)?,
            image_ref: row.get(2)?,
            description: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

impl TryFrom<ProofRow> for SellerProof {
    type Error = MarketError;

    fn try_from(row: ProofRow) -> MarketResult<Self> {
        Ok(SellerProof {
            id: parse_id(&row.id)?,
            seller_id: parse_id(&row.seller_id)?,
            image_ref: row.image_ref,
            description: row.description,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

pub struct SaleRow {
    pub token: String,
    pub seller_id: String,
    pub buyer_id: Option<String>,
    pub listing_id: Option<String>,
    pub quantity: i64,
    pub remaining: Option<i64>,
}

impl SaleRow {
    pub const COLUMNS: &'static str = "token, seller_id, buyer_id, listing_id, quantity, remaining";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get(0)?,
            seller_id: row.get(1)?,
            buyer_id: row.get(2)?,
            listing_id: row.get(3)?,
            quantity: row.get(4)?,
            remaining: row.get(5)?,
        })
    }
}

/// Convert a batch of rows, stopping at the first corrupt one.
pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> MarketResult<Vec<T>>
where
    T: TryFrom<R, Error = MarketError>,
{
    rows.into_iter().map(T::try_from).collect()
}
