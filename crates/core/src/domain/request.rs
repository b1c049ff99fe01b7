use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalId, ApprovalRecord, Decision};
use crate::domain::quote::{QuoteId, SelectedQuote, VendorQuote};
use crate::domain::user::UserId;
use crate::errors::{FieldIssue, ValidationError};
use crate::workflow::policy::WorkflowPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human readable request code, e.g. `PR-2025-001`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestCode(pub String);

impl RequestCode {
    pub fn assign(request_type: RequestType, year: i32, sequence: i64) -> Self {
        Self(format!("{}-{year}-{sequence:03}", request_type.code_prefix()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Purchase,
    Project,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Project => "project",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "purchase" => Some(Self::Purchase),
            "project" => Some(Self::Project),
            _ => None,
        }
    }

    fn code_prefix(&self) -> &'static str {
        match self {
            Self::Purchase => "PR",
            Self::Project => "PJ",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Jpy,
    Cny,
    Cad,
    Aud,
    Chf,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
            Self::Jpy => "JPY",
            Self::Cny => "CNY",
            Self::Cad => "CAD",
            Self::Aud => "AUD",
            Self::Chf => "CHF",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "USD" => Some(Self::Usd),
            "EUR" => Some(Self::Eur),
            "GBP" => Some(Self::Gbp),
            "JPY" => Some(Self::Jpy),
            "CNY" => Some(Self::Cny),
            "CAD" => Some(Self::Cad),
            "AUD" => Some(Self::Aud),
            "CHF" => Some(Self::Chf),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Draft,
    Submitted,
    DmApproved,
    DmRejected,
    AcctApproved,
    AcctRejected,
    FinalApproved,
    FinalRejected,
    FundsTransferred,
}

impl RequestState {
    pub const ALL: [RequestState; 9] = [
        RequestState::Draft,
        RequestState::Submitted,
        RequestState::DmApproved,
        RequestState::DmRejected,
        RequestState::AcctApproved,
        RequestState::AcctRejected,
        RequestState::FinalApproved,
        RequestState::FinalRejected,
        RequestState::FundsTransferred,
    ];

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FundsTransferred | Self::DmRejected | Self::AcctRejected | Self::FinalRejected
        )
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::DmRejected | Self::AcctRejected | Self::FinalRejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Submitted => "SUBMITTED",
            Self::DmApproved => "DM_APPROVED",
            Self::DmRejected => "DM_REJECTED",
            Self::AcctApproved => "ACCT_APPROVED",
            Self::AcctRejected => "ACCT_REJECTED",
            Self::FinalApproved => "FINAL_APPROVED",
            Self::FinalRejected => "FINAL_REJECTED",
            Self::FundsTransferred => "FUNDS_TRANSFERRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == raw)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl RequestItem {
    /// `None` when the product does not fit in a `Decimal`.
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }
}

/// Project-only fields. Optional on the wire so validation can report every
/// missing one at once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDetails {
    pub client_name: Option<String>,
    pub project_description: Option<String>,
    pub total_cost: Option<Decimal>,
    pub total_benefit: Option<Decimal>,
    pub total_price: Option<Decimal>,
}

/// Input for creating a draft request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub request_type: RequestType,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub desired_cost: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub needed_by_date: Option<NaiveDate>,
    #[serde(default)]
    pub items: Vec<RequestItem>,
    #[serde(default)]
    pub project: Option<ProjectDetails>,
}

impl NewRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.title.trim().is_empty() {
            issues.push(FieldIssue::missing("title"));
        }
        if self.desired_cost <= Decimal::ZERO {
            issues.push(FieldIssue::invalid("desired_cost", "must be positive"));
        }

        match self.request_type {
            RequestType::Purchase => {
                validate_items(&self.items, &mut issues);
                if self.project.is_some() {
                    issues.push(FieldIssue::invalid(
                        "project",
                        "only allowed on project requests",
                    ));
                }
            }
            RequestType::Project => {
                if !self.items.is_empty() {
                    issues.push(FieldIssue::invalid("items", "only allowed on purchase requests"));
                }
                validate_project(self.project.as_ref(), &mut issues);
            }
        }

        ValidationError::from_issues(issues)
    }
}

fn validate_items(items: &[RequestItem], issues: &mut Vec<FieldIssue>) {
    for (index, item) in items.iter().enumerate() {
        if item.name.trim().is_empty() {
            issues.push(FieldIssue::missing(format!("items[{index}].name")));
        }
        if item.quantity == 0 {
            issues.push(FieldIssue::invalid(format!("items[{index}].quantity"), "must be positive"));
        }
        if item.unit_price <= Decimal::ZERO {
            issues
                .push(FieldIssue::invalid(format!("items[{index}].unit_price"), "must be positive"));
        } else if item.line_total().is_none() {
            issues.push(FieldIssue::invalid(
                format!("items[{index}].unit_price"),
                "line total is too large",
            ));
        }
    }
    if items.iter().all(|item| item.line_total().is_some()) && items_total(items).is_none() {
        issues.push(FieldIssue::invalid("items", "total is too large"));
    }
}

fn items_total(items: &[RequestItem]) -> Option<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |total, item| total.checked_add(item.line_total()?))
}

fn validate_project(project: Option<&ProjectDetails>, issues: &mut Vec<FieldIssue>) {
    let empty = ProjectDetails::default();
    let project = project.unwrap_or(&empty);

    if project.client_name.as_deref().map(str::trim).unwrap_or_default().is_empty() {
        issues.push(FieldIssue::missing("client_name"));
    }
    if project.project_description.as_deref().map(str::trim).unwrap_or_default().is_empty() {
        issues.push(FieldIssue::missing("project_description"));
    }

    match project.total_cost {
        None => issues.push(FieldIssue::missing("total_cost")),
        Some(value) if value <= Decimal::ZERO => {
            issues.push(FieldIssue::invalid("total_cost", "must be positive"))
        }
        Some(_) => {}
    }
    match project.total_benefit {
        None => issues.push(FieldIssue::missing("total_benefit")),
        Some(value) if value < Decimal::ZERO => {
            issues.push(FieldIssue::invalid("total_benefit", "must not be negative"))
        }
        Some(_) => {}
    }
    match project.total_price {
        None => issues.push(FieldIssue::missing("total_price")),
        Some(value) if value <= Decimal::ZERO => {
            issues.push(FieldIssue::invalid("total_price", "must be positive"))
        }
        Some(_) => {}
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub code: RequestCode,
    pub request_type: RequestType,
    pub title: String,
    pub description: Option<String>,
    pub desired_cost: Decimal,
    pub currency: Currency,
    pub state: RequestState,
    /// Routing hint only. Authorization is decided by role and state.
    pub current_approver_id: Option<UserId>,
    pub requester: UserId,
    pub items: Vec<RequestItem>,
    pub project: Option<ProjectDetails>,
    pub quotes: Vec<VendorQuote>,
    pub selected_quote: Option<SelectedQuote>,
    pub approvals: Vec<ApprovalRecord>,
    pub payout_channel: Option<String>,
    pub payout_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub needed_by_date: Option<NaiveDate>,
    pub funds_transferred_at: Option<DateTime<Utc>>,
    /// Bumped on every persisted mutation; used as the compare-and-set token.
    pub version: u64,
}

impl Request {
    pub fn from_draft(
        id: RequestId,
        sequence: i64,
        requester: UserId,
        draft: NewRequest,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code: RequestCode::assign(draft.request_type, created_at.year(), sequence),
            request_type: draft.request_type,
            title: draft.title.trim().to_string(),
            description: draft.description,
            desired_cost: draft.desired_cost,
            currency: draft.currency,
            state: RequestState::Draft,
            current_approver_id: None,
            requester,
            items: draft.items,
            project: draft.project,
            quotes: Vec::new(),
            selected_quote: None,
            approvals: Vec::new(),
            payout_channel: None,
            payout_reference: None,
            created_at,
            state_changed_at: created_at,
            needed_by_date: draft.needed_by_date,
            funds_transferred_at: None,
            version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn quote(&self, quote_id: &QuoteId) -> Option<&VendorQuote> {
        self.quotes.iter().find(|quote| &quote.id == quote_id)
    }

    pub fn selected(&self) -> Option<&VendorQuote> {
        self.selected_quote.as_ref().and_then(|selected| self.quote(&selected.quote_id))
    }

    pub fn items_total(&self) -> Option<Decimal> {
        items_total(&self.items)
    }

    /// The selection must point at a quote attached to this request.
    pub fn selection_is_consistent(&self) -> bool {
        match &self.selected_quote {
            Some(selected) => self.quote(&selected.quote_id).is_some(),
            None => true,
        }
    }

    /// The implicit PENDING record for the stage currently awaiting a decision.
    pub fn pending_approval(&self, policy: &WorkflowPolicy) -> Option<ApprovalRecord> {
        let stage = policy.stage_for(self.state, self.request_type)?;
        Some(ApprovalRecord {
            id: ApprovalId(format!("pending-{}-{}", self.id, stage)),
            stage,
            approver_id: self.current_approver_id,
            decision: Decision::Pending,
            comment: None,
            created_at: self.state_changed_at,
            decided_at: None,
        })
    }

    /// The rendering the wire and the UI agree on for the request identity.
    pub fn display_code(&self) -> &str {
        &self.code.0
    }

    /// Reconstructs a submission draft, used to re-validate before submit.
    pub fn as_new_request(&self) -> NewRequest {
        NewRequest {
            request_type: self.request_type,
            title: self.title.clone(),
            description: self.description.clone(),
            desired_cost: self.desired_cost,
            currency: self.currency,
            needed_by_date: self.needed_by_date,
            items: self.items.clone(),
            project: self.project.clone(),
        }
    }
}
