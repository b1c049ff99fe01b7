use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::quote::QuoteUpload;
use crate::domain::request::{NewRequest, Request, RequestId};
use crate::domain::user::{Actor, NewUser, User, UserId};
use crate::errors::ApplicationError;
use crate::workflow::{DecisionInput, FundsTransferInput, QuoteSelectionInput};

/// The workflow operations, as seen by any caller. The server implements it
/// against storage; the client implements it over HTTP.
///
/// Every call names its actor explicitly. Mutations return the request as
/// stored after the change; callers still refetch before trusting derived
/// state.
#[async_trait]
pub trait RequestGateway: Send + Sync {
    async fn create_draft(
        &self,
        actor: &Actor,
        draft: NewRequest,
    ) -> Result<Request, ApplicationError>;

    async fn submit_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
        expected_version: Option<u64>,
    ) -> Result<Request, ApplicationError>;

    async fn decide(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: DecisionInput,
    ) -> Result<Request, ApplicationError>;

    async fn upload_quote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        upload: QuoteUpload,
        expected_version: Option<u64>,
    ) -> Result<Request, ApplicationError>;

    async fn select_quote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: QuoteSelectionInput,
    ) -> Result<Request, ApplicationError>;

    async fn transfer_funds(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: FundsTransferInput,
    ) -> Result<Request, ApplicationError>;

    async fn get_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, ApplicationError>;

    /// Requests the actor can decide on right now.
    async fn list_pending_approvals(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError>;

    async fn list_my_requests(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError>;

    async fn register_user(&self, actor: &Actor, user: NewUser) -> Result<User, ApplicationError>;

    async fn list_users(&self, actor: &Actor) -> Result<Vec<User>, ApplicationError>;

    /// Signs in as `user_id`. Unknown and inactive users are
    /// `Unauthenticated`; the returned role is authoritative.
    async fn current_user(&self, user_id: UserId) -> Result<User, ApplicationError>;

    /// Reads one directory entry. Admins may read anyone, everyone else only
    /// themselves.
    async fn get_user(&self, actor: &Actor, user_id: UserId) -> Result<User, ApplicationError>;
}

/// Body of `POST /api/v1/requests/{id}/submit`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBody {
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// Body of `POST /api/v1/requests/{id}/quotes`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteUploadBody {
    #[serde(flatten)]
    pub upload: QuoteUpload,
    #[serde(default)]
    pub expected_version: Option<u64>,
}
