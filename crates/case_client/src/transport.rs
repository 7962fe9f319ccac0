//! HTTP boundary to the case server.
//!
//! Every call goes through [`HttpTransport::send`], which applies the one
//! refresh-and-retry allowed on an authorization failure. Nothing else is
//! retried here; the state machines above decide what a failure means.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::PublicId,
    error::ApiError,
    protocol::{
        AccusationResult, AccuseRequest, ChatAck, ChatRequest, InvestigateResult, JobAccepted,
        MoveRequest, MoveResult, Session, SourceSelection,
    },
};
use tracing::{debug, info, warn};

use crate::{config::ClientSettings, error::ClientError};

pub const ASYNC_CREATE_PATH: &str = "/sessions:async";

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, source: &SourceSelection) -> Result<Session>;
    async fn fetch_session(&self, public_id: &PublicId) -> Result<Session>;
    async fn ask(&self, public_id: &PublicId, request: &ChatRequest) -> Result<ChatAck>;
    async fn move_to(&self, public_id: &PublicId, request: &MoveRequest) -> Result<MoveResult>;
    async fn investigate(&self, public_id: &PublicId) -> Result<InvestigateResult>;
    async fn accuse(
        &self,
        public_id: &PublicId,
        request: &AccuseRequest,
    ) -> Result<AccusationResult>;
}

#[async_trait]
pub trait GenerationApi: Send + Sync {
    async fn create_job(&self, source: &SourceSelection) -> Result<JobAccepted>;
}

/// Credential source owned by the identity layer.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
    async fn refresh(&self) -> Result<()>;
}

pub struct AnonymousAuth;

#[async_trait]
impl AuthProvider for AnonymousAuth {
    async fn access_token(&self) -> Option<String> {
        None
    }

    async fn refresh(&self) -> Result<()> {
        Err(anyhow!("no identity provider configured"))
    }
}

pub struct StaticTokenAuth {
    token: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn access_token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    async fn refresh(&self) -> Result<()> {
        Err(anyhow!("static access token cannot be refreshed"))
    }
}

pub struct HttpTransport {
    http: Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpTransport {
    pub fn new(settings: &ClientSettings, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: settings.api_base_url(),
            auth,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let url = format!("{}{path}", self.base_url);
        let mut refreshed = false;
        loop {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(token) = self.auth.access_token().await {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("{method} {url} failed"))?;
            let status = response.status();
            debug!(%method, path, status = status.as_u16(), "http: response");

            if status == StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(ClientError::Unauthorized.into());
                }
                refreshed = true;
                info!(path, "auth: refreshing credentials after 401");
                if let Err(err) = self.auth.refresh().await {
                    warn!(path, "auth: credential refresh failed: {err}");
                    return Err(ClientError::Unauthorized.into());
                }
                continue;
            }

            if !status.is_success() {
                return Err(rejection(response).await.into());
            }
            return Ok(response);
        }
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Response> {
        let body = serde_json::to_value(body).context("failed to encode request body")?;
        self.send(method, path, Some(body)).await
    }
}

async fn rejection(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if let Ok(api) = serde_json::from_str::<ApiError>(&body) {
        return ClientError::Rejected {
            status: status.as_u16(),
            code: api.code,
            message: api.message,
        };
    }

    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.trim().to_string()
    };
    ClientError::Rejected {
        status: status.as_u16(),
        code: None,
        message,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let url = response.url().clone();
    response
        .json()
        .await
        .with_context(|| format!("invalid response body from {url}"))
}

// Acknowledgements may come back with an empty body.
async fn decode_or_default<T: DeserializeOwned + Default>(response: Response) -> Result<T> {
    let url = response.url().clone();
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read response body from {url}"))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).with_context(|| format!("invalid response body from {url}"))
}

fn session_path(public_id: &PublicId, action: Option<&str>) -> String {
    match action {
        Some(action) => format!("/sessions/{public_id}/{action}"),
        None => format!("/sessions/{public_id}"),
    }
}

#[async_trait]
impl SessionApi for HttpTransport {
    async fn create_session(&self, source: &SourceSelection) -> Result<Session> {
        let response = self.send_json(Method::POST, "/sessions", source).await?;
        decode(response).await
    }

    async fn fetch_session(&self, public_id: &PublicId) -> Result<Session> {
        let response = self
            .send(Method::GET, &session_path(public_id, None), None)
            .await?;
        decode(response).await
    }

    async fn ask(&self, public_id: &PublicId, request: &ChatRequest) -> Result<ChatAck> {
        let response = self
            .send_json(Method::POST, &session_path(public_id, Some("chat")), request)
            .await?;
        decode_or_default(response).await
    }

    async fn move_to(&self, public_id: &PublicId, request: &MoveRequest) -> Result<MoveResult> {
        let response = self
            .send_json(Method::POST, &session_path(public_id, Some("move")), request)
            .await?;
        decode_or_default(response).await
    }

    async fn investigate(&self, public_id: &PublicId) -> Result<InvestigateResult> {
        let response = self
            .send(
                Method::POST,
                &session_path(public_id, Some("investigate")),
                None,
            )
            .await?;
        decode_or_default(response).await
    }

    async fn accuse(
        &self,
        public_id: &PublicId,
        request: &AccuseRequest,
    ) -> Result<AccusationResult> {
        let response = self
            .send_json(Method::POST, &session_path(public_id, Some("accuse")), request)
            .await?;
        decode(response).await
    }
}

#[async_trait]
impl GenerationApi for HttpTransport {
    async fn create_job(&self, source: &SourceSelection) -> Result<JobAccepted> {
        let response = self
            .send_json(Method::POST, ASYNC_CREATE_PATH, source)
            .await?;
        decode(response).await
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
