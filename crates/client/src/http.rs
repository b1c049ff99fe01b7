use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use procura_core::config::BackendConfig;
use procura_core::domain::quote::QuoteUpload;
use procura_core::domain::request::{NewRequest, Request, RequestId};
use procura_core::domain::user::{Actor, NewUser, User, UserId};
use procura_core::errors::{ApplicationError, ErrorEnvelope};
use procura_core::gateway::{QuoteUploadBody, RequestGateway, SubmitBody};
use procura_core::workflow::{DecisionInput, FundsTransferInput, QuoteSelectionInput};

const ACTOR_HEADER: &str = "x-procura-actor";

/// `RequestGateway` over the backend's REST API.
///
/// Failures come back as the server's `ErrorEnvelope` and are returned
/// unchanged. Transport failures and undecodable responses become
/// `ApplicationError::Server`.
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpGateway {
    pub fn new(config: &BackendConfig) -> Result<Self, ApplicationError> {
        Self::with_settings(&config.base_url, config.api_token.clone(), config.timeout_secs)
    }

    pub fn with_settings(
        base_url: &str,
        api_token: Option<SecretString>,
        timeout_secs: u64,
    ) -> Result<Self, ApplicationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_token })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probes `/health`; returns the reported status string.
    pub async fn health(&self) -> Result<String, ApplicationError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(transport)?;
        let body: serde_json::Value = response.json().await.map_err(transport)?;
        Ok(body.get("status").and_then(|status| status.as_str()).unwrap_or("unknown").to_string())
    }

    fn request(&self, method: Method, path: &str, actor: UserId) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/api/v1{path}", self.base_url))
            .header(ACTOR_HEADER, actor.0.to_string());
        match &self.api_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, actor: UserId) -> Result<T, ApplicationError> {
        send(self.request(Method::GET, path, actor)).await
    }

    async fn post<B, T>(&self, path: &str, actor: UserId, body: &B) -> Result<T, ApplicationError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        send(self.request(Method::POST, path, actor).json(body)).await
    }
}

async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ApplicationError> {
    let response = builder.send().await.map_err(transport)?;
    let status = response.status();
    debug!(event_name = "client.http.response", status = status.as_u16(), url = %response.url());

    if status.is_success() {
        return response.json::<T>().await.map_err(transport);
    }

    let bytes = response.bytes().await.map_err(transport)?;
    match serde_json::from_slice::<ErrorEnvelope>(&bytes) {
        Ok(envelope) => Err(envelope.error),
        Err(_) => Err(unexpected_status(status)),
    }
}

fn transport(error: reqwest::Error) -> ApplicationError {
    ApplicationError::Server(error.to_string())
}

fn unexpected_status(status: StatusCode) -> ApplicationError {
    ApplicationError::Server(format!("backend returned {status} without an error envelope"))
}

#[async_trait]
impl RequestGateway for HttpGateway {
    async fn create_draft(
        &self,
        actor: &Actor,
        draft: NewRequest,
    ) -> Result<Request, ApplicationError> {
        self.post("/requests", actor.id, &draft).await
    }

    async fn submit_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
        expected_version: Option<u64>,
    ) -> Result<Request, ApplicationError> {
        self.post(&format!("/requests/{request_id}/submit"), actor.id, &SubmitBody { expected_version })
            .await
    }

    async fn decide(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: DecisionInput,
    ) -> Result<Request, ApplicationError> {
        self.post(&format!("/requests/{request_id}/decision"), actor.id, &input).await
    }

    async fn upload_quote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        upload: QuoteUpload,
        expected_version: Option<u64>,
    ) -> Result<Request, ApplicationError> {
        let body = QuoteUploadBody { upload, expected_version };
        self.post(&format!("/requests/{request_id}/quotes"), actor.id, &body).await
    }

    async fn select_quote(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: QuoteSelectionInput,
    ) -> Result<Request, ApplicationError> {
        self.post(&format!("/requests/{request_id}/selection"), actor.id, &input).await
    }

    async fn transfer_funds(
        &self,
        actor: &Actor,
        request_id: RequestId,
        input: FundsTransferInput,
    ) -> Result<Request, ApplicationError> {
        self.post(&format!("/requests/{request_id}/transfer"), actor.id, &input).await
    }

    async fn get_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, ApplicationError> {
        self.get(&format!("/requests/{request_id}"), actor.id).await
    }

    async fn list_pending_approvals(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError> {
        self.get("/requests/pending", actor.id).await
    }

    async fn list_my_requests(&self, actor: &Actor) -> Result<Vec<Request>, ApplicationError> {
        self.get("/requests/mine", actor.id).await
    }

    async fn register_user(&self, actor: &Actor, user: NewUser) -> Result<User, ApplicationError> {
        self.post("/users", actor.id, &user).await
    }

    async fn list_users(&self, actor: &Actor) -> Result<Vec<User>, ApplicationError> {
        self.get("/users", actor.id).await
    }

    /// Signs in as `user_id`: the backend answers with the stored user,
    /// whose role is authoritative.
    async fn current_user(&self, user_id: UserId) -> Result<User, ApplicationError> {
        self.get("/me", user_id).await
    }

    async fn get_user(&self, actor: &Actor, user_id: UserId) -> Result<User, ApplicationError> {
        self.get(&format!("/users/{user_id}"), actor.id).await
    }
}
