use super::coordinator::{RefreshCoordinator, RefreshTransport};
use super::error::ClientError;
use super::vault::TokenVault;
use crate::application_port::{AccessToken, SessionPair};
use crate::domain_model::{AuthenticatedPrincipal, Principal, RefreshToken, SessionSummary};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: String,
    message: String,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a RefreshToken,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    principal: Principal,
    tokens: SessionPair,
}

#[derive(Debug, Deserialize)]
pub struct ActiveSessions {
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
}

async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::from_status(status, &body));
    }

    let envelope: Envelope<T> = response.json().await?;
    match (envelope.success, envelope.data) {
        (true, Some(data)) => Ok(data),
        _ => {
            let detail = envelope
                .error
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "empty envelope".to_string());
            Err(ClientError::InvalidResponse(detail))
        }
    }
}

/// Calls `POST {base_url}/session/refresh`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRefreshTransport {
    client: Client,
    base_url: String,
}

impl HttpRefreshTransport {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        HttpRefreshTransport {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl RefreshTransport for HttpRefreshTransport {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<SessionPair, ClientError> {
        let response = self
            .client
            .post(format!("{}/session/refresh", self.base_url))
            .json(&RefreshBody { refresh_token })
            .send()
            .await?;
        read_envelope(response).await
    }

    async fn revoke(&self, refresh_token: &RefreshToken) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!("{}/session/logout", self.base_url))
            .json(&RefreshBody { refresh_token })
            .send()
            .await?;
        let _: serde_json::Value = read_envelope(response).await?;
        Ok(())
    }
}

/// API client whose authenticated calls go through a [`RefreshCoordinator`].
#[derive(Clone)]
pub struct AuthorizedClient {
    client: Client,
    base_url: String,
    transport: Arc<HttpRefreshTransport>,
    coordinator: RefreshCoordinator,
}

impl AuthorizedClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        vault: Arc<dyn TokenVault>,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder().timeout(request_timeout).build()?;
        let transport = Arc::new(HttpRefreshTransport::new(client.clone(), base_url.clone()));
        let coordinator = RefreshCoordinator::new(transport.clone(), vault, request_timeout);

        Ok(AuthorizedClient {
            client,
            base_url,
            transport,
            coordinator,
        })
    }

    pub fn from_settings(
        settings: &crate::settings::Client,
        vault: Arc<dyn TokenVault>,
    ) -> Result<Self, ClientError> {
        Self::new(settings.base_url.clone(), settings.request_timeout(), vault)
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Principal, ClientError> {
        let response = self
            .client
            .post(self.url("session/login"))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let data: LoginData = read_envelope(response).await?;
        self.coordinator.sign_in(data.tokens);
        debug!(principal_id = %data.principal.id, "signed in");
        Ok(data.principal)
    }

    /// Revokes the refresh token server-side, then forgets it locally either way.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let Some(pair) = self.coordinator.session() else {
            return Ok(());
        };
        let result = self.transport.revoke(&pair.refresh_token).await;
        self.coordinator.sign_out();
        result
    }

    pub async fn logout_all(&self) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .authorized(|token| {
                self.client
                    .post(self.url("session/logout_all"))
                    .bearer_auth(token.as_str())
            })
            .await?;
        self.coordinator.sign_out();
        Ok(())
    }

    pub async fn me(&self) -> Result<AuthenticatedPrincipal, ClientError> {
        self.get_json("session/me").await
    }

    pub async fn active_sessions(&self) -> Result<ActiveSessions, ClientError> {
        self.get_json("session/active").await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        self.authorized(|token| self.client.get(&url).bearer_auth(token.as_str()))
            .await
    }

    async fn authorized<T, B>(&self, build: B) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Fn(AccessToken) -> reqwest::RequestBuilder,
    {
        self.coordinator
            .execute(|token| {
                let request = build(token);
                async move { read_envelope(request.send().await?).await }
            })
            .await
    }
}
