use rusqlite::Connection;
use tracing::info;

use encore_types::MarketResult;

/// Bring the schema up to date. Foreign keys are declared without `ON DELETE`
/// actions: deleting a user or a listing is an explicit fan-out done by the
/// stores inside one transaction.
pub fn run(conn: &Connection) -> MarketResult<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                email           TEXT NOT NULL UNIQUE,
                password_hash   TEXT NOT NULL,
                is_verified     INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE user_profiles (
                user_id             TEXT PRIMARY KEY REFERENCES users(id),
                bio                 TEXT,
                picture_ref         TEXT,
                total_sales         INTEGER NOT NULL DEFAULT 0 CHECK (total_sales >= 0),
                is_verified_seller  INTEGER NOT NULL DEFAULT 0,
                average_rating      REAL NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE TABLE listings (
                id                  TEXT PRIMARY KEY,
                seller_id           TEXT NOT NULL REFERENCES users(id),
                artist              TEXT NOT NULL,
                concert_date        TEXT NOT NULL,
                venue               TEXT NOT NULL,
                section             TEXT,
                seat_row            TEXT,
                seat                TEXT,
                description         TEXT,
                price_cents         INTEGER NOT NULL CHECK (price_cents >= 0),
                quantity_available  INTEGER NOT NULL CHECK (quantity_available >= 0),
                is_available        INTEGER NOT NULL,
                withdrawn           INTEGER NOT NULL DEFAULT 0,
                version             INTEGER NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE INDEX idx_listings_seller ON listings(seller_id);
            CREATE INDEX idx_listings_date ON listings(concert_date);

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                sender_id   TEXT NOT NULL REFERENCES users(id),
                receiver_id TEXT NOT NULL REFERENCES users(id),
                listing_id  TEXT REFERENCES listings(id),
                body        TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_messages_pair
                ON messages(sender_id, receiver_id, created_at);
            CREATE INDEX idx_messages_unread
                ON messages(receiver_id, is_read);
            CREATE INDEX idx_messages_listing ON messages(listing_id);

            CREATE TABLE reviews (
                id                  TEXT PRIMARY KEY,
                reviewer_id         TEXT NOT NULL REFERENCES users(id),
                reviewed_user_id    TEXT NOT NULL REFERENCES users(id),
                listing_id          TEXT REFERENCES listings(id),
                rating              INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                comment             TEXT,
                created_at          TEXT NOT NULL
            );

            CREATE INDEX idx_reviews_reviewed ON reviews(reviewed_user_id);
            CREATE INDEX idx_reviews_reviewer ON reviews(reviewer_id);

            CREATE TABLE seller_proofs (
                id          TEXT PRIMARY KEY,
                seller_id   TEXT NOT NULL REFERENCES users(id),
                image_ref   TEXT NOT NULL,
                description TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_seller_proofs_seller ON seller_proofs(seller_id);

            -- One row per counted sale, keyed by the caller's transaction token
            CREATE TABLE sale_records (
                token       TEXT PRIMARY KEY,
                seller_id   TEXT NOT NULL REFERENCES users(id),
                buyer_id    TEXT REFERENCES users(id),
                listing_id  TEXT REFERENCES listings(id),
                quantity    INTEGER NOT NULL CHECK (quantity > 0),
                remaining   INTEGER,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_sale_records_seller ON sale_records(seller_id);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (stored review and proof counts)");
        conn.execute_batch(
            "
            BEGIN;

            ALTER TABLE user_profiles ADD COLUMN review_count INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE user_profiles ADD COLUMN proof_count INTEGER NOT NULL DEFAULT 0;

            INSERT INTO schema_version (version) VALUES (2);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
