use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::user::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteId(pub String);

/// A vendor bid attached to a request by an accountant. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorQuote {
    pub id: QuoteId,
    pub vendor_name: String,
    pub quote_total: Decimal,
    pub file_url: String,
    pub notes: Option<String>,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    Manual,
    LowestBid,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::LowestBid => "lowest_bid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(Self::Manual),
            "lowest_bid" => Some(Self::LowestBid),
            _ => None,
        }
    }
}

/// The selection event stamped on a request when a quote is chosen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedQuote {
    pub quote_id: QuoteId,
    pub method: SelectionMethod,
    pub selected_by: UserId,
    pub selected_at: DateTime<Utc>,
}

/// Payload for attaching a vendor quote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteUpload {
    pub vendor_name: String,
    pub quote_total: Decimal,
    pub file_url: String,
    #[serde(default)]
    pub notes: Option<String>,
}
