use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalRecord;
use crate::domain::quote::{QuoteId, SelectedQuote};
use crate::domain::request::RequestState;
use crate::errors::{FieldIssue, ValidationError};
use crate::workflow::selection::QuoteChoice;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Submit,
    Approve,
    Reject,
    UploadQuote,
    SelectQuote,
    TransferFunds,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::UploadQuote => "upload_quote",
            Self::SelectQuote => "select_quote",
            Self::TransferFunds => "transfer_funds",
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::UploadQuote => "attach a quote to",
            Self::SelectQuote => "select a quote on",
            Self::TransferFunds => "transfer funds for",
        })
    }
}

/// Optional inputs carried alongside a transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub comment: Option<String>,
    pub quote_id: Option<QuoteId>,
    pub payout_channel: Option<String>,
    pub payout_reference: Option<String>,
}

impl ActionPayload {
    pub fn comment(&self) -> Option<&str> {
        non_blank(self.comment.as_deref())
    }

    pub fn payout_channel(&self) -> Option<&str> {
        non_blank(self.payout_channel.as_deref())
    }

    pub fn payout_reference(&self) -> Option<&str> {
        non_blank(self.payout_reference.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
}

impl DecisionKind {
    pub fn action(&self) -> WorkflowAction {
        match self {
            Self::Approve => WorkflowAction::Approve,
            Self::Reject => WorkflowAction::Reject,
        }
    }
}

/// Body of a `decide` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub decision: DecisionKind,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub payout_channel: Option<String>,
    #[serde(default)]
    pub quote_id: Option<QuoteId>,
    /// Version the caller last saw; a mismatch means someone else acted first.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl DecisionInput {
    pub fn approve() -> Self {
        Self {
            decision: DecisionKind::Approve,
            comment: None,
            payout_channel: None,
            quote_id: None,
            expected_version: None,
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self { decision: DecisionKind::Reject, comment: Some(comment.into()), ..Self::approve() }
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn payload(&self) -> ActionPayload {
        ActionPayload {
            comment: self.comment.clone(),
            quote_id: self.quote_id.clone(),
            payout_channel: self.payout_channel.clone(),
            payout_reference: None,
        }
    }
}

/// Body of a `select_quote` call: either a `quote_id` or `auto_lowest: true`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSelectionInput {
    #[serde(default)]
    pub quote_id: Option<QuoteId>,
    #[serde(default)]
    pub auto_lowest: bool,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl QuoteSelectionInput {
    pub fn manual(quote_id: QuoteId) -> Self {
        Self { quote_id: Some(quote_id), ..Self::default() }
    }

    pub fn lowest_bid() -> Self {
        Self { auto_lowest: true, ..Self::default() }
    }

    pub fn choice(&self) -> Result<QuoteChoice, ValidationError> {
        match (&self.quote_id, self.auto_lowest) {
            (Some(quote_id), false) => Ok(QuoteChoice::Manual(quote_id.clone())),
            (None, true) => Ok(QuoteChoice::LowestBid),
            (Some(_), true) => Err(ValidationError {
                issues: vec![
                    FieldIssue::invalid("quote_id", "cannot be combined with auto_lowest"),
                    FieldIssue::invalid("auto_lowest", "cannot be combined with quote_id"),
                ],
            }),
            (None, false) => Err(ValidationError {
                issues: vec![FieldIssue::missing("quote_id")],
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsTransferInput {
    pub payout_reference: String,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: RequestState,
    pub to: RequestState,
    pub action: WorkflowAction,
    pub approval: Option<ApprovalRecord>,
    pub selection: Option<SelectedQuote>,
}
