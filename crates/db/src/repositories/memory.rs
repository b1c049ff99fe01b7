use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::RwLock;

use procura_core::domain::request::{NewRequest, Request, RequestId, RequestState};
use procura_core::domain::user::{NewUser, User, UserId};

use super::{extends_history, RepositoryError, RequestRepository, UserRepository};

#[derive(Default)]
pub struct InMemoryRequestRepository {
    requests: RwLock<BTreeMap<i64, Request>>,
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn find_by_id(&self, id: RequestId) -> Result<Option<Request>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn insert(
        &self,
        requester: UserId,
        draft: NewRequest,
        created_at: DateTime<Utc>,
    ) -> Result<Request, RepositoryError> {
        let mut requests = self.requests.write().await;
        let id = requests.keys().next_back().map(|last| last + 1).unwrap_or(1);
        let sequence = requests
            .values()
            .filter(|existing| {
                existing.request_type == draft.request_type
                    && existing.created_at.year() == created_at.year()
            })
            .count() as i64
            + 1;

        let request = Request::from_draft(RequestId(id), sequence, requester, draft, created_at);
        requests.insert(id, request.clone());
        Ok(request)
    }

    async fn save(&self, request: &Request, expected_version: u64) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        let stored = requests
            .get_mut(&request.id.0)
            .ok_or_else(|| RepositoryError::NotFound(format!("request {}", request.id)))?;

        if stored.version != expected_version {
            return Err(RepositoryError::VersionConflict {
                request_id: request.id,
                expected: expected_version,
            });
        }
        if !extends_history(&stored.approvals, &request.approvals) {
            return Err(RepositoryError::HistoryRewrite { request_id: request.id });
        }

        *stored = request.clone();
        Ok(())
    }

    async fn list_by_states(&self, states: &[RequestState]) -> Result<Vec<Request>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.values().filter(|request| states.contains(&request.state)).cloned().collect())
    }

    async fn list_by_requester(&self, requester: UserId) -> Result<Vec<Request>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.values().filter(|request| request.requester == requester).cloned().collect())
    }
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<BTreeMap<i64, User>>,
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(&id.0).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.values().find(|user| user.username == username).cloned())
    }

    async fn insert(&self, user: NewUser) -> Result<User, RepositoryError> {
        let mut users = self.users.write().await;
        let id = users.keys().next_back().map(|last| last + 1).unwrap_or(1);
        let stored = User {
            id: UserId(id),
            username: user.username,
            display_name: user.display_name,
            role: user.role,
            manager_id: user.manager_id,
            active: true,
        };
        users.insert(id, stored.clone());
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.values().cloned().collect())
    }
}
