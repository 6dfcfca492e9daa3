use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, MarketResult};

// -- Listings --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewListing {
    pub artist: String,
    pub concert_date: NaiveDate,
    pub venue: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub row: Option<String>,
    #[serde(default)]
    pub seat: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    pub quantity: i64,
}

impl NewListing {
    pub fn validate(&self) -> MarketResult<()> {
        if self.quantity <= 0 {
            return Err(MarketError::invalid("quantity must be at least 1"));
        }
        if self.price_cents < 0 {
            return Err(MarketError::invalid("price cannot be negative"));
        }
        if self.artist.trim().is_empty() || self.venue.trim().is_empty() {
            return Err(MarketError::invalid("artist and venue are required"));
        }
        Ok(())
    }
}

/// Seller edits. Quantity may drop to zero (sold out elsewhere) but never
/// below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListingUpdate {
    pub price_cents: Option<i64>,
    pub quantity: Option<i64>,
    pub description: Option<String>,
}

impl ListingUpdate {
    pub fn validate(&self) -> MarketResult<()> {
        if matches!(self.price_cents, Some(p) if p < 0) {
            return Err(MarketError::invalid("price cannot be negative"));
        }
        if matches!(self.quantity, Some(q) if q < 0) {
            return Err(MarketError::invalid("quantity cannot be negative"));
        }
        Ok(())
    }
}

// -- Profiles --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileUpdate {
    pub bio: Option<String>,
    pub picture_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(quantity: i64, price_cents: i64) -> NewListing {
        NewListing {
            artist: "Phoebe Bridgers".into(),
            concert_date: NaiveDate::from_ymd_opt(2027, 5, 1).unwrap(),
            venue: "Red Rocks".into(),
            section: None,
            row: None,
            seat: None,
            description: None,
            price_cents,
            quantity,
        }
    }

    #[test]
    fn zero_quantity_is_rejected() {
        assert!(matches!(
            listing(0, 100).validate(),
            Err(MarketError::InvalidArgument(_))
        ));
    }

    #[test]
    fn negative_price_is_rejected() {
        assert!(listing(1, -1).validate().is_err());
        assert!(listing(1, 0).validate().is_ok());
    }

    #[test]
    fn update_allows_sold_out_but_not_negative() {
        let sold_out = ListingUpdate {
            quantity: Some(0),
            ..Default::default()
        };
        assert!(sold_out.validate().is_ok());

        let negative = ListingUpdate {
            quantity: Some(-3),
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn new_listing_rejects_unknown_fields() {
        let json = r#"{"artist":"a","concert_date":"2027-01-01","venue":"v",
            "price_cents":100,"quantity":1,"fee":3}"#;
        assert!(serde_json::from_str::<NewListing>(json).is_err());
    }
}
