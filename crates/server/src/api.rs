use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use procura_core::domain::request::{NewRequest, Request, RequestId};
use procura_core::domain::user::{Actor, NewUser, User, UserId};
use procura_core::errors::{ApplicationError, DomainError, ErrorEnvelope, ValidationError};
use procura_core::gateway::{QuoteUploadBody, RequestGateway, SubmitBody};
use procura_core::workflow::{DecisionInput, FundsTransferInput, QuoteSelectionInput};

use crate::service::WorkflowService;

/// Names the calling user by id. The role is looked up server-side.
pub const ACTOR_HEADER: &str = "x-procura-actor";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

pub type ApiFailure = (StatusCode, Json<ErrorEnvelope>);
pub type ApiResult<T> = Result<Json<T>, ApiFailure>;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<WorkflowService>,
    pub api_token: Option<SecretString>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/me", get(whoami))
        .route("/api/v1/requests", post(create_request))
        .route("/api/v1/requests/mine", get(list_mine))
        .route("/api/v1/requests/pending", get(list_pending))
        .route("/api/v1/requests/{id}", get(get_request))
        .route("/api/v1/requests/{id}/submit", post(submit_request))
        .route("/api/v1/requests/{id}/decision", post(decide))
        .route("/api/v1/requests/{id}/quotes", post(upload_quote))
        .route("/api/v1/requests/{id}/selection", post(select_quote))
        .route("/api/v1/requests/{id}/transfer", post(transfer_funds))
        .route("/api/v1/users", get(list_users).post(register_user))
        .route("/api/v1/users/{id}", get(get_user))
        .with_state(state)
}

/// HTTP status for each error class. Clients rely on the envelope, not on
/// the status, to decide how to recover.
pub fn status_for(error: &ApplicationError) -> StatusCode {
    match error {
        ApplicationError::Domain(
            DomainError::ForbiddenTransition { .. } | DomainError::InsufficientRole { .. },
        ) => StatusCode::FORBIDDEN,
        ApplicationError::Domain(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ApplicationError::AlreadyProcessed { .. } => StatusCode::CONFLICT,
        ApplicationError::NotFound { .. } => StatusCode::NOT_FOUND,
        ApplicationError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        ApplicationError::Persistence(_) | ApplicationError::Server(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ApplicationError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Per-call identity and correlation.
struct Call {
    actor: Actor,
    correlation_id: String,
}

impl Call {
    fn fail(&self, error: ApplicationError) -> ApiFailure {
        failure(error, &self.correlation_id, Some(&self.actor))
    }
}

fn failure(error: ApplicationError, correlation_id: &str, actor: Option<&Actor>) -> ApiFailure {
    let status = status_for(&error);
    warn!(
        event_name = "api.request.failed",
        correlation_id = %correlation_id,
        actor_id = actor.map(|actor| actor.id.0),
        status = status.as_u16(),
        error = %error,
        "api call failed"
    );
    (status, Json(error.into_envelope(correlation_id)))
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn begin(state: &ApiState, headers: &HeaderMap) -> Result<Call, ApiFailure> {
    let correlation_id = correlation_id(headers);

    if let Some(expected) = &state.api_token {
        let presented = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let accepted = presented.is_some_and(|token| {
            bool::from(token.as_bytes().ct_eq(expected.expose_secret().as_bytes()))
        });
        if !accepted {
            return Err(failure(
                ApplicationError::Unauthenticated("missing or invalid bearer token".to_string()),
                &correlation_id,
                None,
            ));
        }
    }

    let user_id = headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            failure(
                ApplicationError::Unauthenticated(format!("`{ACTOR_HEADER}` header is required")),
                &correlation_id,
                None,
            )
        })?;

    let actor = state
        .service
        .resolve_actor(UserId(user_id))
        .await
        .map_err(|error| failure(error, &correlation_id, None))?;

    info!(
        event_name = "api.request.accepted",
        correlation_id = %correlation_id,
        actor_id = actor.id.0,
        role = actor.role.as_str(),
        "api call accepted"
    );
    Ok(Call { actor, correlation_id })
}

fn body<T>(call: &Call, payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiFailure> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| call.fail(ValidationError::single("body", rejection.body_text()).into()))
}

pub async fn whoami(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<User> {
    let call = begin(&state, &headers).await?;
    state.service.current_user(call.actor.id).await.map(Json).map_err(|error| call.fail(error))
}

pub async fn create_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<NewRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Request>), ApiFailure> {
    let call = begin(&state, &headers).await?;
    let draft = body(&call, payload)?;
    state
        .service
        .create_draft(&call.actor, draft)
        .await
        .map(|request| (StatusCode::CREATED, Json(request)))
        .map_err(|error| call.fail(error))
}

pub async fn list_mine(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<Vec<Request>> {
    let call = begin(&state, &headers).await?;
    state.service.list_my_requests(&call.actor).await.map(Json).map_err(|error| call.fail(error))
}

pub async fn list_pending(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Vec<Request>> {
    let call = begin(&state, &headers).await?;
    state
        .service
        .list_pending_approvals(&call.actor)
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn get_request(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<Request> {
    let call = begin(&state, &headers).await?;
    state
        .service
        .get_request(&call.actor, RequestId(id))
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn submit_request(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<SubmitBody>, JsonRejection>,
) -> ApiResult<Request> {
    let call = begin(&state, &headers).await?;
    let submit = body(&call, payload)?;
    state
        .service
        .submit_request(&call.actor, RequestId(id), submit.expected_version)
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn decide(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<DecisionInput>, JsonRejection>,
) -> ApiResult<Request> {
    let call = begin(&state, &headers).await?;
    let input = body(&call, payload)?;
    state
        .service
        .decide(&call.actor, RequestId(id), input)
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn upload_quote(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<QuoteUploadBody>, JsonRejection>,
) -> ApiResult<Request> {
    let call = begin(&state, &headers).await?;
    let QuoteUploadBody { upload, expected_version } = body(&call, payload)?;
    state
        .service
        .upload_quote(&call.actor, RequestId(id), upload, expected_version)
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn select_quote(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<QuoteSelectionInput>, JsonRejection>,
) -> ApiResult<Request> {
    let call = begin(&state, &headers).await?;
    let input = body(&call, payload)?;
    state
        .service
        .select_quote(&call.actor, RequestId(id), input)
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn transfer_funds(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    payload: Result<Json<FundsTransferInput>, JsonRejection>,
) -> ApiResult<Request> {
    let call = begin(&state, &headers).await?;
    let input = body(&call, payload)?;
    state
        .service
        .transfer_funds(&call.actor, RequestId(id), input)
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

pub async fn list_users(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<Vec<User>> {
    let call = begin(&state, &headers).await?;
    state.service.list_users(&call.actor).await.map(Json).map_err(|error| call.fail(error))
}

pub async fn register_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), ApiFailure> {
    let call = begin(&state, &headers).await?;
    let user = body(&call, payload)?;
    state
        .service
        .register_user(&call.actor, user)
        .await
        .map(|user| (StatusCode::CREATED, Json(user)))
        .map_err(|error| call.fail(error))
}

pub async fn get_user(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> ApiResult<User> {
    let call = begin(&state, &headers).await?;
    state
        .service
        .get_user(&call.actor, UserId(id))
        .await
        .map(Json)
        .map_err(|error| call.fail(error))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::{Path, State},
        http::{HeaderMap, HeaderValue, Request as HttpRequest, StatusCode},
        Json,
    };
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use procura_core::audit::NoopAuditSink;
    use procura_core::domain::request::{Currency, NewRequest, RequestState, RequestType};
    use procura_core::domain::user::{NewUser, Role, User};
    use procura_core::errors::{ApplicationError, DomainError, ErrorEnvelope};
    use procura_core::gateway::SubmitBody;
    use procura_core::workflow::{DecisionInput, WorkflowEngine};
    use procura_db::{InMemoryRequestRepository, InMemoryUserRepository, UserRepository};

    use super::{
        create_request, decide, get_request, router, status_for, submit_request, ApiState,
        ACTOR_HEADER,
    };
    use crate::service::WorkflowService;

    async fn state(api_token: Option<&str>) -> (ApiState, Vec<User>) {
        let users = Arc::new(InMemoryUserRepository::default());
        let mut directory = Vec::new();
        for (name, role) in [
            ("dana", Role::DirectManager),
            ("drew", Role::DirectManager),
            ("uma", Role::User),
        ] {
            directory.push(
                users
                    .insert(NewUser {
                        username: name.to_string(),
                        display_name: name.to_string(),
                        role,
                        manager_id: None,
                    })
                    .await
                    .expect("insert user"),
            );
        }

        let service = WorkflowService::new(
            Arc::new(InMemoryRequestRepository::default()),
            users,
            WorkflowEngine::default(),
            Arc::new(NoopAuditSink),
        );
        let state = ApiState {
            service: Arc::new(service),
            api_token: api_token.map(|token| SecretString::from(token.to_string())),
        };
        (state, directory)
    }

    fn as_user(user: &User) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from(user.id.0));
        headers
    }

    fn draft() -> NewRequest {
        NewRequest {
            request_type: RequestType::Purchase,
            title: "Conference tickets".to_string(),
            description: None,
            desired_cost: Decimal::new(1_800, 0),
            currency: Currency::Eur,
            needed_by_date: None,
            items: Vec::new(),
            project: None,
        }
    }

    #[test]
    fn status_mapping_separates_input_permission_and_conflict_errors() {
        assert_eq!(
            status_for(&ApplicationError::Domain(DomainError::CommentRequired)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ApplicationError::Domain(DomainError::ForbiddenTransition {
                state: RequestState::Draft,
                role: Role::User,
                action: procura_core::WorkflowAction::Approve,
            })),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&ApplicationError::AlreadyProcessed {
                request_id: procura_core::RequestId(1),
                current_state: RequestState::DmApproved,
                current_approver_id: None,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ApplicationError::Persistence("disk full".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn second_decision_on_the_same_version_gets_conflict_envelope() {
        let (state, users) = state(None).await;
        let (dana, drew, uma) = (&users[0], &users[1], &users[2]);

        let (status, Json(created)) =
            create_request(State(state.clone()), as_user(uma), Ok(Json(draft())))
                .await
                .expect("create");
        assert_eq!(status, StatusCode::CREATED);
        let Json(submitted) = submit_request(
            State(state.clone()),
            Path(created.id.0),
            as_user(uma),
            Ok(Json(SubmitBody { expected_version: Some(created.version) })),
        )
        .await
        .expect("submit");

        let input = DecisionInput::approve().with_expected_version(submitted.version);
        let Json(approved) =
            decide(State(state.clone()), Path(created.id.0), as_user(dana), Ok(Json(input.clone())))
                .await
                .expect("first decision");
        assert_eq!(approved.state, RequestState::DmApproved);

        let (status, Json(envelope)) =
            decide(State(state.clone()), Path(created.id.0), as_user(drew), Ok(Json(input)))
                .await
                .expect_err("second decision");
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(envelope.error.is_conflict());
        assert!(!envelope.correlation_id.is_empty());

        let Json(current) = get_request(State(state), Path(created.id.0), as_user(drew))
            .await
            .expect("refetch");
        assert_eq!(current.approvals.len(), 1);
    }

    #[tokio::test]
    async fn missing_actor_header_is_unauthenticated() {
        let (state, _) = state(None).await;
        let (status, Json(envelope)) =
            get_request(State(state), Path(1), HeaderMap::new()).await.expect_err("no actor");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(matches!(envelope.error, ApplicationError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn router_enforces_bearer_token_and_returns_envelopes() {
        let (state, users) = state(Some("s3cret")).await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/requests/mine")
                    .header(ACTOR_HEADER, users[2].id.0.to_string())
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let envelope: ErrorEnvelope = serde_json::from_slice(&bytes).expect("envelope");
        assert!(matches!(envelope.error, ApplicationError::Unauthenticated(_)));

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/v1/requests/mine")
                    .header(ACTOR_HEADER, users[2].id.0.to_string())
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/v1/requests")
                    .header(ACTOR_HEADER, users[2].id.0.to_string())
                    .header("authorization", "Bearer s3cret")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"title": "missing everything"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn token_of_the_right_length_but_wrong_bytes_is_refused() {
        let (state, users) = state(Some("s3cret")).await;
        let app = router(state);

        for presented in ["Bearer s3creT", "Bearer s3cre", "Bearer s3cret!", "s3cret"] {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/api/v1/me")
                        .header(ACTOR_HEADER, users[2].id.0.to_string())
                        .header("authorization", presented)
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{presented}");
        }
    }

    #[tokio::test]
    async fn users_read_their_own_entry_but_not_others() {
        let (state, users) = state(None).await;
        let (dana, uma) = (&users[0], &users[2]);
        let app = router(state);

        let fetch = |actor: &User, target: &User| {
            HttpRequest::builder()
                .uri(format!("/api/v1/users/{}", target.id.0))
                .header(ACTOR_HEADER, actor.id.0.to_string())
                .body(Body::empty())
                .expect("request")
        };

        let response = app.clone().oneshot(fetch(uma, uma)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let me: User = serde_json::from_slice(&bytes).expect("user");
        assert_eq!(me.id, uma.id);

        let response = app.clone().oneshot(fetch(uma, dana)).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let envelope: ErrorEnvelope = serde_json::from_slice(&bytes).expect("envelope");
        assert!(matches!(
            envelope.error,
            ApplicationError::Domain(DomainError::InsufficientRole { .. })
        ));

        let response = app.oneshot(fetch(dana, uma)).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "managers are not admins");
    }
}
