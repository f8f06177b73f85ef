//! HTTP client for the account API and the game server's public routes.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use worldlink_net::{CredentialError, JoinKeyProvider};

use crate::error::ApiError;

/// Default account API endpoint (staging).
pub const DEFAULT_API: &str = "https://api.pw-staging.rnc.priddle.nl";

/// Default game server HTTP endpoint (staging).
pub const DEFAULT_GAME_HTTP: &str = "https://server.pw-staging.rnc.priddle.nl";

/// Base URLs the client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    pub api: String,
    pub game_http: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            api: DEFAULT_API.to_string(),
            game_http: DEFAULT_GAME_HTTP.to_string(),
        }
    }
}

/// Responses that rarely change between calls.
///
/// Owned by the client; share one `Arc<ApiCache>` between clients to pool it.
#[derive(Debug, Default)]
pub struct ApiCache {
    room_types: RwLock<Option<Vec<String>>>,
    game_version: RwLock<Option<String>>,
}

impl ApiCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_types(&self) -> Option<Vec<String>> {
        self.room_types.read().clone()
    }

    pub fn game_version(&self) -> Option<String> {
        self.game_version.read().clone()
    }

    pub fn clear(&self) {
        *self.room_types.write() = None;
        *self.game_version.write() = None;
    }
}

/// Successful password authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSession {
    pub token: String,
    /// The account record as returned by the server.
    #[serde(default)]
    pub record: serde_json::Value,
}

#[derive(Deserialize)]
struct JoinKeyResponse {
    token: String,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Deserialize)]
struct FailureBody {
    message: String,
}

#[derive(Debug, Clone)]
struct Account {
    email: String,
    password: String,
}

/// Account API client.
///
/// Built either from a token (usable immediately) or from an email and
/// password, in which case [`authenticate`](Self::authenticate) must run
/// before any restricted call.
pub struct ApiClient {
    http: reqwest::Client,
    endpoints: ApiEndpoints,
    token: RwLock<Option<String>>,
    account: Option<Account>,
    cache: Arc<ApiCache>,
}

impl ApiClient {
    pub fn with_token(token: impl Into<String>, endpoints: ApiEndpoints) -> Self {
        Self::build(endpoints, Some(token.into()), None)
    }

    pub fn with_credentials(
        email: impl Into<String>,
        password: impl Into<String>,
        endpoints: ApiEndpoints,
    ) -> Self {
        let account = Account {
            email: email.into(),
            password: password.into(),
        };
        Self::build(endpoints, None, Some(account))
    }

    fn build(endpoints: ApiEndpoints, token: Option<String>, account: Option<Account>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
            token: RwLock::new(token),
            account,
            cache: Arc::new(ApiCache::new()),
        }
    }

    /// Replace the client's cache with a shared one.
    pub fn with_cache(mut self, cache: Arc<ApiCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<ApiCache> {
        &self.cache
    }

    pub fn endpoints(&self) -> &ApiEndpoints {
        &self.endpoints
    }

    pub fn logged_in(&self) -> bool {
        self.token.read().is_some()
    }

    /// Log in with the stored email and password.
    pub async fn authenticate(&self) -> Result<AuthSession, ApiError> {
        let account = self.account.clone().ok_or(ApiError::MissingCredentials)?;
        self.authenticate_with(&account.email, &account.password).await
    }

    /// Log in with explicit details. They are not remembered; only the
    /// resulting token is.
    #[tracing::instrument(skip_all)]
    pub async fn authenticate_with(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, ApiError> {
        if email.is_empty() || password.is_empty() {
            return Err(ApiError::MissingCredentials);
        }
        let url = format!(
            "{}/api/collections/users/auth-with-password",
            self.endpoints.api
        );
        let body = serde_json::json!({ "identity": email, "password": password });
        let resp = self.http.post(&url).json(&body).send().await?;
        let session: AuthSession = check(resp).await?.json().await?;

        *self.token.write() = Some(session.token.clone());
        tracing::info!("Authenticated account");
        Ok(session)
    }

    /// Fetch a join key for a room. Requires a token.
    pub async fn join_key(&self, room_type: &str, room_id: &str) -> Result<String, ApiError> {
        let token = self.token.read().clone().ok_or(ApiError::MissingCredentials)?;
        let url = format!("{}/api/joinkey/{room_type}/{room_id}", self.endpoints.api);
        let resp = self
            .http
            .get(&url)
            .header("authorization", token)
            .send()
            .await?;
        let key: JoinKeyResponse = check(resp).await?.json().await?;
        tracing::debug!(room_type, room_id, "Fetched join key");
        Ok(key.token)
    }

    /// Room types the game server accepts. Served from the cache unless
    /// `skip_cache` is set or nothing is cached yet.
    pub async fn room_types(&self, skip_cache: bool) -> Result<Vec<String>, ApiError> {
        if !skip_cache && let Some(types) = self.cache.room_types() {
            return Ok(types);
        }
        let url = format!("{}/listroomtypes", self.endpoints.game_http);
        let types: Vec<String> = check(self.http.get(&url).send().await?).await?.json().await?;
        *self.cache.room_types.write() = Some(types.clone());
        Ok(types)
    }

    /// Current game version, cached like [`room_types`](Self::room_types).
    pub async fn game_version(&self, skip_cache: bool) -> Result<String, ApiError> {
        if !skip_cache && let Some(version) = self.cache.game_version() {
            return Ok(version);
        }
        let url = format!("{}/version", self.endpoints.game_http);
        let body: VersionResponse = check(self.http.get(&url).send().await?).await?.json().await?;
        *self.cache.game_version.write() = Some(body.version.clone());
        Ok(body.version)
    }

    async fn fetch_join_key(&self, room_id: &str) -> Result<String, CredentialError> {
        if !self.logged_in() {
            self.authenticate().await?;
        }
        let room_types = self.room_types(false).await?;
        let room_type = room_types.first().ok_or_else(|| {
            CredentialError::Provider(anyhow::anyhow!("server advertised no room types"))
        })?;
        let key = self.join_key(room_type, room_id).await?;
        if key.is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(key)
    }
}

impl JoinKeyProvider for ApiClient {
    fn join_key<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<String, CredentialError>> {
        self.fetch_join_key(room_id).boxed()
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoints", &self.endpoints)
            .field("logged_in", &self.logged_in())
            .finish_non_exhaustive()
    }
}

async fn check(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status == StatusCode::FORBIDDEN {
        return Err(ApiError::Forbidden);
    }
    if status.is_client_error() || status.is_server_error() {
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<FailureBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}
