use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::quote::QuoteId;
use crate::domain::request::{RequestId, RequestState};
use crate::domain::user::{Role, UserId};
use crate::workflow::states::WorkflowAction;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub problem: String,
}

impl FieldIssue {
    pub fn missing(field: impl Into<String>) -> Self {
        Self { field: field.into(), problem: "is required".to_string() }
    }

    pub fn invalid(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self { field: field.into(), problem: problem.into() }
    }
}

/// Every missing or invalid field of a payload, reported together.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("validation failed: {}", render_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self { issues: vec![FieldIssue::invalid(field, problem)] }
    }

    pub fn from_issues(issues: Vec<FieldIssue>) -> Result<(), Self> {
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Self { issues })
        }
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.issues.iter().any(|issue| issue.field == field)
    }
}

fn render_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{} {}", issue.field, issue.problem))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{role} cannot {action} a request in state {state}")]
    ForbiddenTransition { state: RequestState, role: Role, action: WorkflowAction },
    #[error("a comment is required when rejecting")]
    CommentRequired,
    #[error("a quote must be selected before approving")]
    MustSelectQuoteFirst,
    #[error("no quotes are available on this request")]
    NoQuotesAvailable,
    #[error("quote `{}` does not belong to this request", quote_id.0)]
    UnknownQuote { quote_id: QuoteId },
    #[error("{role} cannot {operation}; requires {required}")]
    InsufficientRole { role: Role, required: Role, operation: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "detail", rename_all = "snake_case")]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("request {request_id} was already processed by another approver; it is now {current_state}")]
    AlreadyProcessed {
        request_id: RequestId,
        current_state: RequestState,
        current_approver_id: Option<UserId>,
    },
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ValidationError> for ApplicationError {
    fn from(value: ValidationError) -> Self {
        Self::Domain(DomainError::Validation(value))
    }
}

/// What the caller should do about a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Correct the input and resubmit.
    FixInput,
    /// Retrying cannot help; only a different actor or state can.
    None,
    /// Reload the canonical request; the local copy is stale.
    Refresh,
    /// Transient; the same action may be retried by the user.
    Retry,
}

impl ApplicationError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            Self::Domain(DomainError::ForbiddenTransition { .. })
            | Self::Domain(DomainError::InsufficientRole { .. })
            | Self::Unauthenticated(_)
            | Self::Configuration(_) => Recovery::None,
            Self::Domain(_) => Recovery::FixInput,
            Self::AlreadyProcessed { .. } | Self::NotFound { .. } => Recovery::Refresh,
            Self::Persistence(_) | Self::Server(_) => Recovery::Retry,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyProcessed { .. })
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Domain(DomainError::ForbiddenTransition { .. })
            | Self::Domain(DomainError::InsufficientRole { .. }) => {
                "You are not allowed to perform this action on the request in its current state."
            }
            Self::Domain(DomainError::CommentRequired) => "Please add a comment explaining the rejection.",
            Self::Domain(DomainError::MustSelectQuoteFirst) => {
                "Select a quote before approving this request."
            }
            Self::Domain(DomainError::NoQuotesAvailable) => {
                "Upload at least one vendor quote before selecting or approving."
            }
            Self::Domain(_) => "The request could not be processed. Check inputs and try again.",
            Self::AlreadyProcessed { .. } => {
                "This request was already processed by another approver. The latest state has been loaded."
            }
            Self::NotFound { .. } => "The request could not be found.",
            Self::Unauthenticated(_) => "Your session is not recognised. Sign in again.",
            Self::Persistence(_) | Self::Server(_) => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Configuration(_) => "An unexpected internal error occurred.",
        }
    }

    pub fn into_envelope(self, correlation_id: impl Into<String>) -> ErrorEnvelope {
        ErrorEnvelope {
            message: self.user_message().to_string(),
            correlation_id: correlation_id.into(),
            error: self,
        }
    }
}

/// Wire shape of a failed API call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApplicationError,
    pub message: String,
    pub correlation_id: String,
}

#[cfg(test)]
mod tests {
    use crate::domain::request::{RequestId, RequestState};
    use crate::domain::user::{Role, UserId};
    use crate::errors::{
        ApplicationError, DomainError, ErrorEnvelope, Recovery, ValidationError,
    };
    use crate::workflow::states::WorkflowAction;

    #[test]
    fn validation_errors_ask_for_corrected_input() {
        let error = ApplicationError::from(ValidationError::single("desired_cost", "must be positive"));

        assert_eq!(error.recovery(), Recovery::FixInput);
        assert_eq!(
            error.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
        assert_eq!(error.to_string(), "validation failed: desired_cost must be positive");
    }

    #[test]
    fn forbidden_transitions_are_not_retryable() {
        let error = ApplicationError::from(DomainError::ForbiddenTransition {
            state: RequestState::FundsTransferred,
            role: Role::Accountant,
            action: WorkflowAction::UploadQuote,
        });

        assert_eq!(error.recovery(), Recovery::None);
        assert_eq!(
            error.to_string(),
            "ACCOUNTANT cannot attach a quote to a request in state FUNDS_TRANSFERRED"
        );
    }

    #[test]
    fn conflicts_trigger_refresh_and_server_errors_retry() {
        let conflict = ApplicationError::AlreadyProcessed {
            request_id: RequestId(4),
            current_state: RequestState::DmApproved,
            current_approver_id: None,
        };
        assert!(conflict.is_conflict());
        assert_eq!(conflict.recovery(), Recovery::Refresh);

        let server = ApplicationError::Server("upstream returned 502".to_string());
        assert_eq!(server.recovery(), Recovery::Retry);
        assert!(!server.is_conflict());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = ApplicationError::AlreadyProcessed {
            request_id: RequestId(9),
            current_state: RequestState::FinalRejected,
            current_approver_id: Some(UserId(2)),
        }
        .into_envelope("req-1");

        let json = serde_json::to_string(&envelope).expect("serialize envelope");
        assert!(json.contains("\"class\":\"already_processed\""));
        let decoded: ErrorEnvelope = serde_json::from_str(&json).expect("decode envelope");
        assert_eq!(decoded, envelope);

        let domain = ApplicationError::from(DomainError::CommentRequired).into_envelope("req-2");
        let json = serde_json::to_string(&domain).expect("serialize domain envelope");
        assert!(json.contains("\"kind\":\"comment_required\""));
        let decoded: ErrorEnvelope = serde_json::from_str(&json).expect("decode domain envelope");
        assert_eq!(decoded.error, ApplicationError::Domain(DomainError::CommentRequired));
    }
}
