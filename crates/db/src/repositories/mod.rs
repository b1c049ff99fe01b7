use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use procura_core::domain::approval::ApprovalRecord;
use procura_core::domain::request::{NewRequest, Request, RequestId, RequestState};
use procura_core::domain::user::{NewUser, User, UserId};
use procura_core::errors::ApplicationError;

pub mod memory;
pub mod request;
pub mod user;

pub use memory::{InMemoryRequestRepository, InMemoryUserRepository};
pub use request::SqlRequestRepository;
pub use user::SqlUserRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    /// The stored row moved past `expected`; someone else wrote first.
    #[error("request {request_id} is no longer at version {expected}")]
    VersionConflict { request_id: RequestId, expected: u64 },
    #[error("request {request_id} would rewrite its approval history")]
    HistoryRewrite { request_id: RequestId },
    #[error("{0} not found")]
    NotFound(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::NotFound(resource) => ApplicationError::NotFound { resource },
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

/// True when `next` keeps every stored approval record, in order and with
/// the same decision, and only adds records after them.
pub(crate) fn extends_history(stored: &[ApprovalRecord], next: &[ApprovalRecord]) -> bool {
    next.len() >= stored.len()
        && stored.iter().zip(next).all(|(old, new)| {
            old.id == new.id
                && old.stage == new.stage
                && old.approver_id == new.approver_id
                && old.decision == new.decision
                && old.comment == new.comment
        })
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<Request>, RepositoryError>;

    /// Stores a new DRAFT and assigns its id and per-year code.
    async fn insert(
        &self,
        requester: UserId,
        draft: NewRequest,
        created_at: DateTime<Utc>,
    ) -> Result<Request, RepositoryError>;

    /// Compare-and-set: writes `request` only while the stored version is
    /// still `expected_version`. Quotes and approval records are appended,
    /// never rewritten.
    async fn save(&self, request: &Request, expected_version: u64) -> Result<(), RepositoryError>;

    async fn list_by_states(&self, states: &[RequestState]) -> Result<Vec<Request>, RepositoryError>;

    async fn list_by_requester(&self, requester: UserId) -> Result<Vec<Request>, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError>;
    async fn insert(&self, user: NewUser) -> Result<User, RepositoryError>;
    async fn list(&self) -> Result<Vec<User>, RepositoryError>;
}
