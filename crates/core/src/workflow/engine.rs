use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::approval::{ApprovalId, ApprovalRecord, Decision};
use crate::domain::quote::{QuoteId, QuoteUpload, SelectedQuote, VendorQuote};
use crate::domain::request::{Request, RequestState};
use crate::domain::user::{Actor, Role};
use crate::errors::{DomainError, FieldIssue, ValidationError};
use crate::workflow::policy::{Permissions, WorkflowPolicy};
use crate::workflow::selection::{self, QuoteChoice};
use crate::workflow::states::{ActionPayload, TransitionOutcome, WorkflowAction};

/// Result of a successful operation: the updated request and what happened.
///
/// `changed == false` marks an idempotent no-op (reselecting the current
/// quote); the request is returned untouched with the same version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub request: Request,
    pub outcome: TransitionOutcome,
    pub changed: bool,
}

/// Pure transition logic. Never performs I/O; callers persist the returned
/// request with a compare-and-set on the previous version.
#[derive(Clone, Debug, Default)]
pub struct WorkflowEngine {
    policy: WorkflowPolicy,
}

impl WorkflowEngine {
    pub fn new(policy: WorkflowPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    pub fn permissions(&self, request: &Request, actor: &Actor) -> Permissions {
        self.policy.can_act(request.state, actor.role, request.request_type)
    }

    pub fn submit(
        &self,
        request: &Request,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Applied, DomainError> {
        if request.state != RequestState::Draft || request.requester != actor.id {
            return Err(forbidden(request, actor, WorkflowAction::Submit));
        }
        request.as_new_request().validate()?;

        let mut next = request.clone();
        next.state = RequestState::Submitted;
        next.state_changed_at = now;
        next.current_approver_id = None;
        next.version += 1;

        Ok(Applied {
            outcome: outcome(request.state, next.state, WorkflowAction::Submit, None, None),
            request: next,
            changed: true,
        })
    }

    /// Validates and applies a decision (`approve`, `reject`) or the funds
    /// transfer to `request`.
    pub fn apply(
        &self,
        request: &Request,
        action: WorkflowAction,
        actor: &Actor,
        payload: &ActionPayload,
        now: DateTime<Utc>,
    ) -> Result<Applied, DomainError> {
        match action {
            WorkflowAction::Submit => return self.submit(request, actor, now),
            WorkflowAction::UploadQuote | WorkflowAction::SelectQuote => {
                return Err(ValidationError::single(
                    "action",
                    format!("`{}` is not a decision", action.as_str()),
                )
                .into());
            }
            WorkflowAction::Approve | WorkflowAction::Reject | WorkflowAction::TransferFunds => {}
        }

        if !self.permissions(request, actor).allows(action) {
            return Err(forbidden(request, actor, action));
        }

        let comment = payload.comment().map(str::to_string);
        if action == WorkflowAction::Reject && comment.is_none() {
            return Err(DomainError::CommentRequired);
        }

        let payout_reference = payload.payout_reference().map(str::to_string);
        if action == WorkflowAction::TransferFunds && payout_reference.is_none() {
            return Err(ValidationError { issues: vec![FieldIssue::missing("payout_reference")] }
                .into());
        }

        let selection = if action == WorkflowAction::Approve
            && actor.role == Role::Accountant
            && request.state == RequestState::DmApproved
        {
            self.require_selection(request, actor, payload, now)?
        } else {
            None
        };

        let to = self
            .policy
            .next_state(request.state, action, request.request_type)
            .ok_or_else(|| forbidden(request, actor, action))?;

        let approval = self.policy.stage_for(request.state, request.request_type).map(|stage| {
            ApprovalRecord {
                id: ApprovalId(Uuid::new_v4().to_string()),
                stage,
                approver_id: Some(actor.id),
                decision: if action == WorkflowAction::Reject {
                    Decision::Rejected
                } else {
                    Decision::Approved
                },
                comment,
                created_at: request.state_changed_at,
                decided_at: Some(now),
            }
        });

        let mut next = request.clone();
        next.state = to;
        next.state_changed_at = now;
        next.current_approver_id = None;
        next.version += 1;
        if let Some(selected) = &selection {
            next.selected_quote = Some(selected.clone());
        }
        if let Some(record) = &approval {
            next.approvals.push(record.clone());
        }
        if to == RequestState::FinalApproved {
            next.payout_channel = payload.payout_channel().map(str::to_string);
        }
        if to == RequestState::FundsTransferred {
            next.payout_reference = payout_reference;
            next.funds_transferred_at = Some(now);
        }

        Ok(Applied {
            outcome: outcome(request.state, to, action, approval, selection),
            request: next,
            changed: true,
        })
    }

    pub fn upload_quote(
        &self,
        request: &Request,
        actor: &Actor,
        upload: &QuoteUpload,
        now: DateTime<Utc>,
    ) -> Result<Applied, DomainError> {
        if !self.permissions(request, actor).can_upload_quote {
            return Err(forbidden(request, actor, WorkflowAction::UploadQuote));
        }
        validate_upload(upload)?;

        let mut next = request.clone();
        next.quotes.push(VendorQuote {
            id: QuoteId(Uuid::new_v4().to_string()),
            vendor_name: upload.vendor_name.trim().to_string(),
            quote_total: upload.quote_total,
            file_url: upload.file_url.trim().to_string(),
            notes: upload
                .notes
                .as_deref()
                .map(str::trim)
                .filter(|notes| !notes.is_empty())
                .map(str::to_string),
            uploaded_by: actor.id,
            uploaded_at: now,
        });
        next.version += 1;

        Ok(Applied {
            outcome: outcome(request.state, request.state, WorkflowAction::UploadQuote, None, None),
            request: next,
            changed: true,
        })
    }

    /// Selects a quote ahead of the accountant's approval. Reselecting the
    /// current quote is a no-op; switching is allowed until the stage is
    /// approved.
    pub fn select_quote(
        &self,
        request: &Request,
        actor: &Actor,
        choice: &QuoteChoice,
        now: DateTime<Utc>,
    ) -> Result<Applied, DomainError> {
        if !self.permissions(request, actor).can_select_quote {
            return Err(forbidden(request, actor, WorkflowAction::SelectQuote));
        }

        let chosen = selection::resolve(request, choice)?;
        let unchanged = request
            .selected_quote
            .as_ref()
            .map(|current| current.quote_id == chosen.id)
            .unwrap_or(false);
        if unchanged {
            return Ok(Applied {
                outcome: outcome(
                    request.state,
                    request.state,
                    WorkflowAction::SelectQuote,
                    None,
                    request.selected_quote.clone(),
                ),
                request: request.clone(),
                changed: false,
            });
        }

        let selected = SelectedQuote {
            quote_id: chosen.id.clone(),
            method: choice.method(),
            selected_by: actor.id,
            selected_at: now,
        };
        let mut next = request.clone();
        next.selected_quote = Some(selected.clone());
        next.version += 1;

        Ok(Applied {
            outcome: outcome(
                request.state,
                request.state,
                WorkflowAction::SelectQuote,
                None,
                Some(selected),
            ),
            request: next,
            changed: true,
        })
    }

    /// Runs every check `apply` would run without producing a transition.
    pub fn preflight(
        &self,
        request: &Request,
        action: WorkflowAction,
        actor: &Actor,
        payload: &ActionPayload,
    ) -> Result<(), DomainError> {
        self.apply(request, action, actor, payload, Utc::now()).map(|_| ())
    }

    pub fn apply_with_audit<S>(
        &self,
        request: &Request,
        action: WorkflowAction,
        actor: &Actor,
        payload: &ActionPayload,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<Applied, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(request, action, actor, payload, now);
        record_outcome(sink, audit, action, &result);
        result
    }

    fn require_selection(
        &self,
        request: &Request,
        actor: &Actor,
        payload: &ActionPayload,
        now: DateTime<Utc>,
    ) -> Result<Option<SelectedQuote>, DomainError> {
        if request.selected_quote.is_some() {
            return Ok(None);
        }
        if request.quotes.is_empty() {
            return Err(DomainError::NoQuotesAvailable);
        }
        let Some(quote_id) = &payload.quote_id else {
            return Err(DomainError::MustSelectQuoteFirst);
        };

        let choice = QuoteChoice::Manual(quote_id.clone());
        let chosen = selection::resolve(request, &choice)?;
        Ok(Some(SelectedQuote {
            quote_id: chosen.id.clone(),
            method: choice.method(),
            selected_by: actor.id,
            selected_at: now,
        }))
    }
}

/// Emits the audit event for any workflow operation result.
pub fn record_outcome<S>(
    sink: &S,
    audit: &AuditContext,
    action: WorkflowAction,
    result: &Result<Applied, DomainError>,
) where
    S: AuditSink + ?Sized,
{
    let category = match action {
        WorkflowAction::UploadQuote | WorkflowAction::SelectQuote => AuditCategory::Quote,
        _ => AuditCategory::Workflow,
    };
    match result {
        Ok(applied) => sink.emit(
            AuditEvent::new(audit, "workflow.transition_applied", category, AuditOutcome::Success)
                .with_metadata("action", action.as_str())
                .with_metadata("from", applied.outcome.from.as_str())
                .with_metadata("to", applied.outcome.to.as_str())
                .with_metadata("changed", applied.changed.to_string()),
        ),
        Err(error) => sink.emit(
            AuditEvent::new(audit, "workflow.transition_rejected", category, AuditOutcome::Rejected)
                .with_metadata("action", action.as_str())
                .with_metadata("error", error.to_string()),
        ),
    }
}

fn forbidden(request: &Request, actor: &Actor, action: WorkflowAction) -> DomainError {
    DomainError::ForbiddenTransition { state: request.state, role: actor.role, action }
}

fn outcome(
    from: RequestState,
    to: RequestState,
    action: WorkflowAction,
    approval: Option<ApprovalRecord>,
    selection: Option<SelectedQuote>,
) -> TransitionOutcome {
    TransitionOutcome { from, to, action, approval, selection }
}

fn validate_upload(upload: &QuoteUpload) -> Result<(), ValidationError> {
    let mut issues = Vec::new();
    if upload.vendor_name.trim().is_empty() {
        issues.push(FieldIssue::missing("vendor_name"));
    }
    if upload.quote_total <= Decimal::ZERO {
        issues.push(FieldIssue::invalid("quote_total", "must be positive"));
    }
    if upload.file_url.trim().is_empty() {
        issues.push(FieldIssue::missing("file_url"));
    }
    ValidationError::from_issues(issues)
}
