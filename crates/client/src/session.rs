use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use procura_core::domain::quote::{QuoteId, QuoteUpload};
use procura_core::domain::request::{Request, RequestId};
use procura_core::domain::user::Actor;
use procura_core::errors::{ApplicationError, DomainError, Recovery};
use procura_core::gateway::RequestGateway;
use procura_core::workflow::{
    ActionPayload, DecisionInput, DecisionKind, FundsTransferInput, Permissions,
    QuoteSelectionInput, WorkflowAction, WorkflowEngine,
};

use crate::notice::{Notice, NoticeLevel, NoticeSink};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another action is already in flight")]
    Busy,
    #[error("no request is open in this session")]
    NoRequest,
    #[error(transparent)]
    Rejected(#[from] ApplicationError),
}

impl SessionError {
    pub fn application(&self) -> Option<&ApplicationError> {
        match self {
            Self::Rejected(error) => Some(error),
            _ => None,
        }
    }
}

/// Inputs of the approve/reject form. Kept on failure so the user can fix and
/// resend; cleared only after a successful decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionForm {
    pub decision: DecisionKind,
    pub comment: String,
    pub payout_channel: String,
    pub quote_id: Option<QuoteId>,
}

impl DecisionForm {
    pub fn approve() -> Self {
        Self {
            decision: DecisionKind::Approve,
            comment: String::new(),
            payout_channel: String::new(),
            quote_id: None,
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self { decision: DecisionKind::Reject, comment: comment.into(), ..Self::approve() }
    }

    pub fn is_blank(&self) -> bool {
        self.comment.is_empty() && self.payout_channel.is_empty() && self.quote_id.is_none()
    }

    pub fn reset(&mut self) {
        self.comment.clear();
        self.payout_channel.clear();
        self.quote_id = None;
    }

    fn to_input(&self, expected_version: u64) -> DecisionInput {
        DecisionInput {
            decision: self.decision,
            comment: non_blank(&self.comment),
            payout_channel: non_blank(&self.payout_channel),
            quote_id: self.quote_id.clone(),
            expected_version: Some(expected_version),
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// One actor reviewing one request.
///
/// Every mutation is gated by a busy flag, checked locally with the same
/// engine the backend runs, sent with the version last seen, and followed by
/// a refetch. The session never applies a change to its local copy; it only
/// replaces the copy with what the backend returns.
pub struct ReviewSession {
    gateway: Arc<dyn RequestGateway>,
    actor: Actor,
    engine: WorkflowEngine,
    notices: Arc<dyn NoticeSink>,
    busy: AtomicBool,
    current: RwLock<Option<Request>>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReviewSession {
    pub fn new(
        gateway: Arc<dyn RequestGateway>,
        actor: Actor,
        engine: WorkflowEngine,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        Self {
            gateway,
            actor,
            engine,
            notices,
            busy: AtomicBool::new(false),
            current: RwLock::new(None),
        }
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn current(&self) -> Option<Request> {
        self.current.read().await.clone()
    }

    /// What the actor may do on the open request; drives which controls are
    /// shown.
    pub async fn permissions(&self) -> Permissions {
        match self.current.read().await.as_ref() {
            Some(request) => self.engine.permissions(request, &self.actor),
            None => Permissions::NONE,
        }
    }

    pub async fn open(&self, request_id: RequestId) -> Result<Request, SessionError> {
        let request = self.gateway.get_request(&self.actor, request_id).await.map_err(|error| {
            self.report(request_id, &error);
            SessionError::Rejected(error)
        })?;
        *self.current.write().await = Some(request.clone());
        Ok(request)
    }

    pub async fn refresh(&self) -> Result<Request, SessionError> {
        let request_id = self.open_id().await?;
        self.open(request_id).await
    }

    pub async fn submit(&self) -> Result<Request, SessionError> {
        let (actor, gateway) = (self.actor, Arc::clone(&self.gateway));
        self.guarded(
            WorkflowAction::Submit,
            |engine, request| engine.submit(request, &actor, Utc::now()).map(|_| ()),
            move |request| async move {
                gateway.submit_request(&actor, request.id, Some(request.version)).await
            },
        )
        .await
    }

    /// Sends the form as an approve/reject decision. The form is reset only
    /// when the decision is accepted.
    pub async fn decide(&self, form: &mut DecisionForm) -> Result<Request, SessionError> {
        let (actor, gateway) = (self.actor, Arc::clone(&self.gateway));
        let template = form.clone();
        let result = self
            .guarded(
                template.decision.action(),
                |engine, request| {
                    let input = template.to_input(request.version);
                    engine.preflight(request, input.decision.action(), &actor, &input.payload())
                },
                |request| {
                    let input = template.to_input(request.version);
                    async move { gateway.decide(&actor, request.id, input).await }
                },
            )
            .await;

        if result.is_ok() {
            form.reset();
        }
        result
    }

    pub async fn upload_quote(&self, upload: QuoteUpload) -> Result<Request, SessionError> {
        let (actor, gateway) = (self.actor, Arc::clone(&self.gateway));
        let checked = upload.clone();
        self.guarded(
            WorkflowAction::UploadQuote,
            move |engine, request| engine.upload_quote(request, &actor, &checked, Utc::now()).map(|_| ()),
            move |request| async move {
                gateway.upload_quote(&actor, request.id, upload, Some(request.version)).await
            },
        )
        .await
    }

    pub async fn select_quote(&self, input: QuoteSelectionInput) -> Result<Request, SessionError> {
        let (actor, gateway) = (self.actor, Arc::clone(&self.gateway));
        let choice = input.choice().map_err(DomainError::from);
        self.guarded(
            WorkflowAction::SelectQuote,
            move |engine, request| {
                let choice = choice?;
                engine.select_quote(request, &actor, &choice, Utc::now()).map(|_| ())
            },
            move |request| async move {
                let input = QuoteSelectionInput { expected_version: Some(request.version), ..input };
                gateway.select_quote(&actor, request.id, input).await
            },
        )
        .await
    }

    pub async fn transfer_funds(&self, payout_reference: &str) -> Result<Request, SessionError> {
        let (actor, gateway) = (self.actor, Arc::clone(&self.gateway));
        let payout_reference = payout_reference.to_string();
        let payload = ActionPayload {
            payout_reference: Some(payout_reference.clone()),
            ..ActionPayload::default()
        };
        self.guarded(
            WorkflowAction::TransferFunds,
            move |engine, request| {
                engine.preflight(request, WorkflowAction::TransferFunds, &actor, &payload)
            },
            move |request| async move {
                let input = FundsTransferInput {
                    payout_reference,
                    expected_version: Some(request.version),
                };
                gateway.transfer_funds(&actor, request.id, input).await
            },
        )
        .await
    }

    async fn open_id(&self) -> Result<RequestId, SessionError> {
        self.current.read().await.as_ref().map(|request| request.id).ok_or(SessionError::NoRequest)
    }

    async fn guarded<P, C, Fut>(
        &self,
        action: WorkflowAction,
        preflight: P,
        call: C,
    ) -> Result<Request, SessionError>
    where
        P: FnOnce(&WorkflowEngine, &Request) -> Result<(), DomainError>,
        C: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Request, ApplicationError>>,
    {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!(event_name = "client.session.busy", action = action.as_str());
            return Err(SessionError::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        let request = self.current().await.ok_or(SessionError::NoRequest)?;
        if let Err(error) = preflight(&self.engine, &request) {
            let error = ApplicationError::from(error);
            self.report(request.id, &error);
            return Err(error.into());
        }

        match call(request.clone()).await {
            Ok(saved) => {
                info!(
                    event_name = "client.session.applied",
                    request_id = %request.id,
                    action = action.as_str(),
                    "action accepted; refetching"
                );
                let latest = match self.gateway.get_request(&self.actor, request.id).await {
                    Ok(latest) => latest,
                    Err(error) => {
                        self.notices.notify(Notice {
                            level: NoticeLevel::Warning,
                            message: format!(
                                "Saved, but the latest version could not be loaded: {}",
                                error.user_message()
                            ),
                            request_id: Some(request.id),
                            recovery: Some(Recovery::Refresh),
                        });
                        saved
                    }
                };
                *self.current.write().await = Some(latest.clone());
                self.notices.notify(Notice::info(
                    request.id,
                    format!("{} is now {}.", latest.display_code(), latest.state),
                ));
                Ok(latest)
            }
            Err(error) if error.is_conflict() => {
                // The stale decision is dropped; the user sees what won.
                self.report(request.id, &error);
                match self.gateway.get_request(&self.actor, request.id).await {
                    Ok(latest) => *self.current.write().await = Some(latest),
                    Err(refetch) => {
                        warn!(
                            event_name = "client.session.refetch_failed",
                            request_id = %request.id,
                            action = action.as_str(),
                            error = %refetch,
                            "conflict refetch failed; cached request is stale"
                        );
                        self.notices.notify(Notice {
                            level: NoticeLevel::Warning,
                            message: format!(
                                "The winning version could not be loaded: {} Refresh first.",
                                refetch.user_message()
                            ),
                            request_id: Some(request.id),
                            recovery: Some(Recovery::Refresh),
                        });
                    }
                }
                Err(error.into())
            }
            Err(error) => {
                self.report(request.id, &error);
                Err(error.into())
            }
        }
    }

    fn report(&self, request_id: RequestId, error: &ApplicationError) {
        let recovery = error.recovery();
        let level = match recovery {
            Recovery::Retry | Recovery::None => NoticeLevel::Error,
            Recovery::FixInput | Recovery::Refresh => NoticeLevel::Warning,
        };
        let message = match error {
            ApplicationError::AlreadyProcessed { current_state, current_approver_id, .. } => {
                match current_approver_id {
                    Some(approver) => format!(
                        "{} It is now {current_state}, assigned to user {approver}.",
                        error.user_message()
                    ),
                    None => format!("{} It is now {current_state}.", error.user_message()),
                }
            }
            _ => error.user_message().to_string(),
        };
        self.notices.notify(Notice { level, message, request_id: Some(request_id), recovery: Some(recovery) });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use procura_core::audit::NoopAuditSink;
    use procura_core::domain::quote::QuoteUpload;
    use procura_core::domain::request::{Currency, NewRequest, Request, RequestId, RequestState, RequestType};
    use procura_core::domain::user::{Actor, NewUser, Role, User, UserId};
    use procura_core::errors::{ApplicationError, DomainError, Recovery};
    use procura_core::gateway::RequestGateway;
    use procura_core::workflow::{
        DecisionInput, FundsTransferInput, QuoteSelectionInput, WorkflowEngine,
    };
    use procura_db::{InMemoryRequestRepository, InMemoryUserRepository, UserRepository};
    use procura_server::WorkflowService;

    use super::{DecisionForm, ReviewSession, SessionError};
    use crate::notice::{InMemoryNoticeSink, NoticeLevel};

    /// Delegates to the real service, yielding before each decision and
    /// optionally failing decisions with a transport error.
    struct Wrapped {
        inner: WorkflowService,
        decisions: AtomicUsize,
        fail_decisions: bool,
        fail_reads: AtomicBool,
    }

    #[async_trait]
    impl RequestGateway for Wrapped {
        async fn create_draft(&self, actor: &Actor, draft: NewRequest) -> Result<Request, ApplicationError> {
            self.inner.create_draft(actor, draft).await
        }

        async fn submit_request(
            &self,
            actor: &Actor,
            request_id: RequestId,
            expected_version: Option<u64>,
        ) -> Result<Request, ApplicationError> {
            self.inner.submit_request(actor, request_id, expected_version).await
        }

        async fn decide(
            &self,
            actor: &Actor,
            request_id: RequestId,
            input: DecisionInput,
        ) -> Result<Request, ApplicationError> {
            self.decisions.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail_decisions {
                return Err(ApplicationError::Server("connection reset".to_string()));
            }
            self.inner.decide(actor, request_id, input).await
        }

        async fn upload_quote(
            &self,
            actor: &Actor,
            request_id: RequestId,
            upload: QuoteUpload,
            expected_version: Option<u64>,
        ) -> Result<Request, ApplicationError> {
            self.inner.upload_quote(actor, request_id, upload, expected_version).await
        }

        async fn select_quote(
            &self,
            actor: &Actor,
            request_id: RequestId,
            input: QuoteSelectionInput,
        ) -> Result<Request, ApplicationError> {
            self.inner.select_quote(actor, request_id, input).await
        }

        async fn transfer_funds(
            &self,
            actor: &Actor,
            request_id: RequestId,
            input: FundsTransferInput,
        ) -> Result<Request, ApplicationError> {
            self.inner.transfer_funds(actor, request_id, input).await
        }

        async fn get_request(&self, actor: &Actor, request_id: RequestId) -> Result<Request, ApplicationError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(ApplicationError::Server("connection reset".to_string()));
            }
            self.inner.get_request(actor, request_id).await
        }

        async fn list_pending_approvals(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError> {
            self.inner.list_pending_approvals(actor).await
        }

        async fn list_my_requests(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError> {
            self.inner.list_my_requests(actor).await
        }

        async fn register_user(&self, actor: &Actor, user: NewUser) -> Result<User, ApplicationError> {
            self.inner.register_user(actor, user).await
        }

        async fn list_users(&self, actor: &Actor) -> Result<Vec<User>, ApplicationError> {
            self.inner.list_users(actor).await
        }

        async fn current_user(&self, user_id: UserId) -> Result<User, ApplicationError> {
            self.inner.current_user(user_id).await
        }

        async fn get_user(&self, actor: &Actor, user_id: UserId) -> Result<User, ApplicationError> {
            self.inner.get_user(actor, user_id).await
        }
    }

    struct Bench {
        gateway: Arc<Wrapped>,
        dana: Actor,
        drew: Actor,
        alex: Actor,
        request_id: RequestId,
    }

    /// A submitted purchase waiting on the direct-manager stage.
    async fn bench(fail_decisions: bool) -> Bench {
        let users = Arc::new(InMemoryUserRepository::default());
        let mut actors = Vec::new();
        for (name, role) in [
            ("dana", Role::DirectManager),
            ("drew", Role::DirectManager),
            ("alex", Role::Accountant),
            ("uma", Role::User),
        ] {
            let user = users
                .insert(NewUser {
                    username: name.to_string(),
                    display_name: name.to_string(),
                    role,
                    manager_id: None,
                })
                .await
                .expect("insert user");
            actors.push(user.actor());
        }

        let inner = WorkflowService::new(
            Arc::new(InMemoryRequestRepository::default()),
            users,
            WorkflowEngine::default(),
            Arc::new(NoopAuditSink),
        );
        let uma = actors[3];
        let draft = inner
            .create_draft(
                &uma,
                NewRequest {
                    request_type: RequestType::Purchase,
                    title: "Ergonomic chairs".to_string(),
                    description: None,
                    desired_cost: Decimal::new(2_400, 0),
                    currency: Currency::Gbp,
                    needed_by_date: None,
                    items: Vec::new(),
                    project: None,
                },
            )
            .await
            .expect("draft");
        inner.submit_request(&uma, draft.id, None).await.expect("submit");

        Bench {
            gateway: Arc::new(Wrapped {
                inner,
                decisions: AtomicUsize::new(0),
                fail_decisions,
                fail_reads: AtomicBool::new(false),
            }),
            dana: actors[0],
            drew: actors[1],
            alex: actors[2],
            request_id: draft.id,
        }
    }

    fn session(bench: &Bench, actor: Actor, notices: &InMemoryNoticeSink) -> ReviewSession {
        ReviewSession::new(
            bench.gateway.clone(),
            actor,
            WorkflowEngine::default(),
            Arc::new(notices.clone()),
        )
    }

    #[tokio::test]
    async fn second_action_while_busy_is_refused() {
        let bench = bench(false).await;
        let notices = InMemoryNoticeSink::default();
        let session = session(&bench, bench.dana, &notices);
        session.open(bench.request_id).await.expect("open");

        let mut first = DecisionForm::approve();
        let mut second = DecisionForm::reject("Changed my mind");
        let (a, b) = tokio::join!(session.decide(&mut first), session.decide(&mut second));

        assert!(a.is_ok(), "{a:?}");
        assert!(matches!(b, Err(SessionError::Busy)));
        assert_eq!(bench.gateway.decisions.load(Ordering::SeqCst), 1);
        assert!(!session.is_busy());
        assert_eq!(second.comment, "Changed my mind", "refused form keeps its input");
    }

    #[tokio::test]
    async fn losing_a_race_refetches_and_warns() {
        let bench = bench(false).await;
        let dana_notices = InMemoryNoticeSink::default();
        let drew_notices = InMemoryNoticeSink::default();
        let dana = session(&bench, bench.dana, &dana_notices);
        let drew = session(&bench, bench.drew, &drew_notices);
        dana.open(bench.request_id).await.expect("open");
        drew.open(bench.request_id).await.expect("open");

        let mut approve = DecisionForm::approve();
        dana.decide(&mut approve).await.expect("dana wins");

        let mut reject = DecisionForm::reject("Too expensive");
        let error = drew.decide(&mut reject).await.expect_err("drew is stale");
        let error = error.application().expect("application error");
        assert!(error.is_conflict());
        assert_eq!(reject.comment, "Too expensive");

        let current = drew.current().await.expect("refetched");
        assert_eq!(current.state, RequestState::DmApproved);
        assert_eq!(current.approvals.len(), 1);
        let notice = drew_notices.last().expect("conflict notice");
        assert_eq!(notice.level, NoticeLevel::Warning);
        assert_eq!(notice.recovery, Some(Recovery::Refresh));
        assert!(notice.message.contains("DM_APPROVED"), "{}", notice.message);
        assert!(!drew.permissions().await.any());
    }

    #[tokio::test]
    async fn failed_refetch_after_a_conflict_is_reported() {
        let bench = bench(false).await;
        let dana_notices = InMemoryNoticeSink::default();
        let drew_notices = InMemoryNoticeSink::default();
        let dana = session(&bench, bench.dana, &dana_notices);
        let drew = session(&bench, bench.drew, &drew_notices);
        dana.open(bench.request_id).await.expect("open");
        let stale = drew.open(bench.request_id).await.expect("open");

        let mut approve = DecisionForm::approve();
        dana.decide(&mut approve).await.expect("dana wins");

        bench.gateway.fail_reads.store(true, Ordering::SeqCst);
        let mut reject = DecisionForm::reject("Too expensive");
        let error = drew.decide(&mut reject).await.expect_err("drew is stale");
        assert!(error.application().is_some_and(ApplicationError::is_conflict));

        let notices = drew_notices.notices();
        assert!(notices.iter().any(|notice| notice.message.contains("DM_APPROVED")));
        let last = notices.last().expect("refetch notice");
        assert_eq!(last.level, NoticeLevel::Warning);
        assert_eq!(last.recovery, Some(Recovery::Refresh));
        assert!(last.message.contains("could not be loaded"), "{}", last.message);
        assert_eq!(drew.current().await, Some(stale), "cached copy is left for an explicit refresh");
    }

    #[tokio::test]
    async fn preflight_fails_fast_without_calling_the_backend() {
        let bench = bench(false).await;
        let notices = InMemoryNoticeSink::default();
        let dana = session(&bench, bench.dana, &notices);
        dana.open(bench.request_id).await.expect("open");

        let mut form = DecisionForm::reject("   ");
        let error = dana.decide(&mut form).await.expect_err("comment required");
        assert_eq!(
            error.application(),
            Some(&ApplicationError::Domain(DomainError::CommentRequired))
        );
        assert_eq!(bench.gateway.decisions.load(Ordering::SeqCst), 0);

        let alex = session(&bench, bench.alex, &notices);
        alex.open(bench.request_id).await.expect("open");
        let mut approve = DecisionForm::approve();
        let error = alex.decide(&mut approve).await.expect_err("not the accountant's stage");
        assert!(matches!(
            error.application(),
            Some(ApplicationError::Domain(DomainError::ForbiddenTransition { .. }))
        ));
        assert_eq!(notices.last().map(|notice| notice.level), Some(NoticeLevel::Error));
    }

    #[tokio::test]
    async fn server_errors_are_reported_once_and_never_retried() {
        let bench = bench(true).await;
        let notices = InMemoryNoticeSink::default();
        let dana = session(&bench, bench.dana, &notices);
        let opened = dana.open(bench.request_id).await.expect("open");

        let mut form = DecisionForm::approve();
        form.comment = "Looks fine".to_string();
        let error = dana.decide(&mut form).await.expect_err("transport failure");
        assert!(matches!(error.application(), Some(ApplicationError::Server(_))));
        assert_eq!(bench.gateway.decisions.load(Ordering::SeqCst), 1);
        assert_eq!(form.comment, "Looks fine");
        assert_eq!(dana.current().await, Some(opened));

        let notice = notices.last().expect("error notice");
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.recovery, Some(Recovery::Retry));
    }

    #[tokio::test]
    async fn success_resets_the_form_and_refetches() {
        let bench = bench(false).await;
        let notices = InMemoryNoticeSink::default();
        let dana = session(&bench, bench.dana, &notices);
        dana.open(bench.request_id).await.expect("open");

        let mut form = DecisionForm::approve();
        form.comment = "Approved for Q3".to_string();
        let latest = dana.decide(&mut form).await.expect("approve");

        assert!(form.is_blank());
        assert_eq!(latest.state, RequestState::DmApproved);
        assert_eq!(dana.current().await, Some(latest.clone()));
        assert_eq!(latest.approvals[0].comment.as_deref(), Some("Approved for Q3"));
        assert_eq!(notices.last().map(|notice| notice.level), Some(NoticeLevel::Info));
    }

    #[tokio::test]
    async fn actions_need_an_open_request() {
        let bench = bench(false).await;
        let notices = InMemoryNoticeSink::default();
        let dana = session(&bench, bench.dana, &notices);
        assert!(matches!(dana.refresh().await, Err(SessionError::NoRequest)));
        assert!(matches!(dana.transfer_funds("TX-1").await, Err(SessionError::NoRequest)));
    }
}
