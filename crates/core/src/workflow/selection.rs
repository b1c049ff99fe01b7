use serde::{Deserialize, Serialize};

use crate::domain::quote::{QuoteId, SelectionMethod, VendorQuote};
use crate::domain::request::Request;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteChoice {
    Manual(QuoteId),
    LowestBid,
}

impl QuoteChoice {
    pub fn method(&self) -> SelectionMethod {
        match self {
            Self::Manual(_) => SelectionMethod::Manual,
            Self::LowestBid => SelectionMethod::LowestBid,
        }
    }
}

/// Cheapest quote; ties go to the earliest upload, then to the lowest id so
/// the result never depends on storage order.
pub fn lowest_bid(quotes: &[VendorQuote]) -> Option<&VendorQuote> {
    quotes.iter().min_by(|left, right| {
        left.quote_total
            .cmp(&right.quote_total)
            .then_with(|| left.uploaded_at.cmp(&right.uploaded_at))
            .then_with(|| left.id.cmp(&right.id))
    })
}

/// Resolves a choice against the request's quotes.
pub fn resolve<'a>(
    request: &'a Request,
    choice: &QuoteChoice,
) -> Result<&'a VendorQuote, DomainError> {
    if request.quotes.is_empty() {
        return Err(DomainError::NoQuotesAvailable);
    }

    match choice {
        QuoteChoice::Manual(quote_id) => request
            .quote(quote_id)
            .ok_or_else(|| DomainError::UnknownQuote { quote_id: quote_id.clone() }),
        QuoteChoice::LowestBid => lowest_bid(&request.quotes).ok_or(DomainError::NoQuotesAvailable),
    }
}
