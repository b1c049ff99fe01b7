use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use procura_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use procura_core::domain::approval::Stage;
use procura_core::domain::quote::QuoteUpload;
use procura_core::domain::request::{NewRequest, Request, RequestId, RequestState, RequestType};
use procura_core::domain::user::{Actor, NewUser, Role, User, UserId};
use procura_core::errors::{ApplicationError, DomainError, FieldIssue, ValidationError};
use procura_core::gateway::RequestGateway;
use procura_core::workflow::{
    record_outcome, ActionPayload, Applied, DecisionInput, FundsTransferInput,
    QuoteSelectionInput, WorkflowAction, WorkflowEngine,
};
use procura_db::{RepositoryError, RequestRepository, UserRepository};

/// The authoritative implementation of the workflow operations.
///
/// Every mutation runs load → engine → compare-and-set save. A stale
/// `expected_version` or a lost race on save surfaces as
/// `ApplicationError::AlreadyProcessed` carrying the current state.
#[derive(Clone)]
pub struct WorkflowService {
    requests: Arc<dyn RequestRepository>,
    users: Arc<dyn UserRepository>,
    engine: WorkflowEngine,
    audit: Arc<dyn AuditSink>,
}

impl WorkflowService {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        users: Arc<dyn UserRepository>,
        engine: WorkflowEngine,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { requests, users, engine, audit }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Resolves the caller's identity from the user store. The role always
    /// comes from storage.
    pub async fn resolve_actor(&self, user_id: UserId) -> Result<Actor, ApplicationError> {
        self.active_user(user_id).await.map(|user| user.actor())
    }

    async fn active_user(&self, user_id: UserId) -> Result<User, ApplicationError> {
        match self.users.find_by_id(user_id).await? {
            Some(user) if user.active => Ok(user),
            Some(_) => Err(ApplicationError::Unauthenticated(format!("user {user_id} is inactive"))),
            None => Err(ApplicationError::Unauthenticated(format!("unknown user {user_id}"))),
        }
    }

    async fn load(&self, request_id: RequestId) -> Result<Request, ApplicationError> {
        self.requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found(format!("request {request_id}")))
    }

    async fn mutate<F>(
        &self,
        actor: &Actor,
        request_id: RequestId,
        expected_version: Option<u64>,
        action: WorkflowAction,
        operation: F,
    ) -> Result<Request, ApplicationError>
    where
        F: FnOnce(&WorkflowEngine, &Request) -> Result<Applied, DomainError> + Send,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let audit = AuditContext::new(Some(request_id), &correlation_id, format!("user:{}", actor.id));
        let current = self.load(request_id).await?;

        if let Some(expected) = expected_version {
            if expected != current.version {
                return Err(self.conflict(&audit, action, &current, expected));
            }
        }

        let result = operation(&self.engine, &current);
        record_outcome(self.audit.as_ref(), &audit, action, &result);
        let applied = result?;
        if !applied.changed {
            info!(
                event_name = "workflow.request.unchanged",
                correlation_id = %correlation_id,
                request_id = %request_id,
                actor_id = %actor.id,
                action = action.as_str(),
                "operation left the request unchanged"
            );
            return Ok(applied.request);
        }

        let mut next = applied.request;
        if action == WorkflowAction::Submit {
            next.current_approver_id = self.approver_hint(&next).await?;
        }

        match self.requests.save(&next, current.version).await {
            Ok(()) => {}
            Err(RepositoryError::VersionConflict { .. }) => {
                let latest = self.load(request_id).await?;
                return Err(self.conflict(&audit, action, &latest, current.version));
            }
            Err(error) => return Err(error.into()),
        }

        info!(
            event_name = "workflow.request.saved",
            correlation_id = %correlation_id,
            request_id = %request_id,
            actor_id = %actor.id,
            action = action.as_str(),
            from = current.state.as_str(),
            to = next.state.as_str(),
            version = next.version,
            "request saved"
        );
        Ok(next)
    }

    /// The requester's manager owns the direct-manager stage. Pooled stages
    /// carry no hint.
    async fn approver_hint(&self, request: &Request) -> Result<Option<UserId>, ApplicationError> {
        if self.engine.policy().stage_for(request.state, request.request_type) != Some(Stage::Dm) {
            return Ok(None);
        }
        Ok(self.users.find_by_id(request.requester).await?.and_then(|user| user.manager_id))
    }

    fn conflict(
        &self,
        audit: &AuditContext,
        action: WorkflowAction,
        latest: &Request,
        stale_version: u64,
    ) -> ApplicationError {
        warn!(
            event_name = "workflow.request.conflict",
            correlation_id = %audit.correlation_id,
            request_id = %latest.id,
            actor = %audit.actor,
            action = action.as_str(),
            stale_version,
            current_version = latest.version,
            current_state = latest.state.as_str(),
            "request was already processed"
        );
        self.audit.emit(
            AuditEvent::new(audit, "workflow.conflict", AuditCategory::Persistence, AuditOutcome::Conflict)
                .with_metadata("action", action.as_str())
                .with_metadata("current_state", latest.state.as_str())
                .with_metadata("current_version", latest.version.to_string()),
        );
        ApplicationError::AlreadyProcessed {
            request_id: latest.id,
            current_state: latest.state,
            current_approver_id: latest.current_approver_id,
        }
    }

    fn require_admin(actor: &Actor, operation: &str) -> Result<(), ApplicationError> {
        if actor.role == Role::Admin {
            return Ok(());
        }
        Err(DomainError::InsufficientRole {
            role: actor.role,
            required: Role::Admin,
            operation: operation.to_string(),
        }
        .into())
    }
}

#[async_trait]
impl RequestGateway for WorkflowService {
    async fn create_draft(
        &self,
        actor: &Actor,
        draft: NewRequest,
    ) -> Result<Request, ApplicationError> {
        draft.validate()?;
        let request = self.requests.insert(actor.id, draft, Utc::now()).await?;

        info!(
            event_name = "workflow.request.drafted",
            request_id = %request.id,
            actor_id = %actor.id,
            code = request.display_code(),
            "draft stored"
        );
        Ok(request)
    }

    async fn submit_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
        expected_version: Option<u64>,
    ) -> Result<Request, ApplicationError> {
        self.mutate(actor, request_id, expected_version, WorkflowAction::Submit, |engine, request| {
            engine.submit(request, actor, Utc::now())
        })
        .await
    }

    async fn decide(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: DecisionInput,
    ) -> Result<Request, ApplicationError> {
        let action = input.decision.action();
        let payload = input.payload();
        self.mutate(actor, request_id, input.expected_version, action, |engine, request| {
            engine.apply(request, action, actor, &payload, Utc::now())
        })
        .await
    }

    async fn upload_quote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        upload: QuoteUpload,
        expected_version: Option<u64>,
    ) -> Result<Request, ApplicationError> {
        self.mutate(
            actor,
            request_id,
            expected_version,
            WorkflowAction::UploadQuote,
            |engine, request| engine.upload_quote(request, actor, &upload, Utc::now()),
        )
        .await
    }

    async fn select_quote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: QuoteSelectionInput,
    ) -> Result<Request, ApplicationError> {
        let choice = input.choice()?;
        self.mutate(
            actor,
            request_id,
            input.expected_version,
            WorkflowAction::SelectQuote,
            |engine, request| engine.select_quote(request, actor, &choice, Utc::now()),
        )
        .await
    }

    async fn transfer_funds(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: FundsTransferInput,
    ) -> Result<Request, ApplicationError> {
        let payload =
            ActionPayload { payout_reference: Some(input.payout_reference), ..ActionPayload::default() };
        self.mutate(
            actor,
            request_id,
            input.expected_version,
            WorkflowAction::TransferFunds,
            |engine, request| {
                engine.apply(request, WorkflowAction::TransferFunds, actor, &payload, Utc::now())
            },
        )
        .await
    }

    async fn get_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, ApplicationError> {
        let request = self.load(request_id).await?;
        // Plain users only see their own requests; approver roles see all.
        if actor.role == Role::User && request.requester != actor.id {
            return Err(ApplicationError::not_found(format!("request {request_id}")));
        }
        Ok(request)
    }

    async fn list_pending_approvals(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError> {
        let policy = self.engine.policy();
        let states: Vec<RequestState> = RequestState::ALL
            .into_iter()
            .filter(|state| {
                [RequestType::Purchase, RequestType::Project]
                    .into_iter()
                    .any(|request_type| policy.is_pending_for(*state, actor.role, request_type))
            })
            .collect();
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.requests.list_by_states(&states).await?;
        Ok(candidates
            .into_iter()
            .filter(|request| policy.is_pending_for(request.state, actor.role, request.request_type))
            .collect())
    }

    async fn list_my_requests(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError> {
        Ok(self.requests.list_by_requester(actor.id).await?)
    }

    async fn register_user(&self, actor: &Actor, user: NewUser) -> Result<User, ApplicationError> {
        Self::require_admin(actor, "register users")?;

        let mut issues = Vec::new();
        if user.username.trim().is_empty() {
            issues.push(FieldIssue::missing("username"));
        } else if self.users.find_by_username(user.username.trim()).await?.is_some() {
            issues.push(FieldIssue::invalid("username", "is already taken"));
        }
        if user.display_name.trim().is_empty() {
            issues.push(FieldIssue::missing("display_name"));
        }
        if let Some(manager_id) = user.manager_id {
            if self.users.find_by_id(manager_id).await?.is_none() {
                issues.push(FieldIssue::invalid("manager_id", "does not name a known user"));
            }
        }
        ValidationError::from_issues(issues)?;

        let stored = self
            .users
            .insert(NewUser {
                username: user.username.trim().to_string(),
                display_name: user.display_name.trim().to_string(),
                ..user
            })
            .await?;

        self.audit.emit(
            AuditEvent::new(
                &AuditContext::new(None, Uuid::new_v4().to_string(), format!("user:{}", actor.id)),
                "directory.user_registered",
                AuditCategory::Directory,
                AuditOutcome::Success,
            )
            .with_metadata("user_id", stored.id.to_string())
            .with_metadata("role", stored.role.as_str()),
        );
        info!(
            event_name = "directory.user.registered",
            actor_id = %actor.id,
            user_id = %stored.id,
            role = stored.role.as_str(),
            "user registered"
        );
        Ok(stored)
    }

    async fn list_users(&self, actor: &Actor) -> Result<Vec<User>, ApplicationError> {
        Self::require_admin(actor, "list users")?;
        Ok(self.users.list().await?)
    }

    async fn current_user(&self, user_id: UserId) -> Result<User, ApplicationError> {
        self.active_user(user_id).await
    }

    async fn get_user(&self, actor: &Actor, user_id: UserId) -> Result<User, ApplicationError> {
        if actor.id != user_id {
            Self::require_admin(actor, "read other users")?;
        }
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found(format!("user {user_id}")))
    }
}
