//! API client for the admissions backend.
//!
//! Every request goes through [`ApiClient::send`], which attaches the current
//! access token and refreshes it first when it has expired. A failed refresh
//! ends the session and is reported as [`SessionChange::Expired`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::auth::{Clock, Identity, SessionData, SessionStore, SystemClock, TokenPair};

use super::{ApiError, ApiRequest, RefreshError, RequestBody};

// ============================================================================
// Constants
// ============================================================================

/// Backend used when nothing else is configured
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// Login exchange, relative to the base URL
pub const DEFAULT_LOGIN_PATH: &str = "/token/";

/// Refresh exchange, relative to the base URL
pub const DEFAULT_REFRESH_PATH: &str = "/token/refresh/";

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Refresh when this many seconds or fewer remain on the access token.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 30;

/// Buffered session changes per subscriber
const SESSION_CHANGE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub refresh_margin: chrono::Duration,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            refresh_margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn refresh_margin(mut self, margin: chrono::Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE_URL)
    }
}

/// A change to the session made by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    SignedIn,
    TokensRefreshed,
    SignedOut,
    /// The refresh token was rejected or could not be used; the session has
    /// been cleared and the user must log in again.
    Expired,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    /// Absent when the backend does not rotate refresh tokens
    refresh: Option<String>,
}

/// API client for the admissions backend.
/// Clone is cheap - all clones share one session and connection pool.
#[derive(Clone, Debug)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    http: Client,
    config: ClientConfig,
    session: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a refresh; stores the outcome of the last one.
    refresh_lock: Mutex<Result<(), RefreshError>>,
    session_change_sender: broadcast::Sender<SessionChange>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, session: Arc<SessionStore>) -> Result<Self, ApiError> {
        Self::with_clock(config, session, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ClientConfig,
        session: Arc<SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        let (session_change_sender, _) = broadcast::channel(SESSION_CHANGE_CAPACITY);

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                config,
                session,
                clock,
                refresh_lock: Mutex::new(Ok(())),
                session_change_sender,
            }),
        })
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.inner.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Listen for logins, refreshes, logouts and expiries.
    pub fn subscribe_to_session_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.inner.session_change_sender.subscribe()
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.inner.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn is_expired(&self, identity: &Identity) -> bool {
        identity.is_expired_at(self.inner.clock.now(), self.inner.config.refresh_margin)
    }

    fn notify(&self, change: SessionChange) {
        // No subscribers is fine
        let _ = self.inner.session_change_sender.send(change);
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Session =====

    /// Exchange credentials for a token pair and start a session.
    ///
    /// On failure the current session is left as it was.
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, ApiError> {
        let url = self.url(&self.inner.config.login_path);
        debug!(url = %url, username, "Sending login request");

        let response = self
            .inner
            .http
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        let identity = Identity::decode(&login.access).map_err(|e| {
            ApiError::InvalidResponse(format!("Login returned an unreadable access token: {}", e))
        })?;
        let identity = self.inner.session.set_session(SessionData {
            tokens: TokenPair::new(login.access, login.refresh),
            identity,
        });

        info!(user_id = %identity.user_id, "Login successful");
        self.notify(SessionChange::SignedIn);
        Ok(identity)
    }

    /// End the session. Safe to call when not logged in.
    pub fn logout(&self) {
        let was_authenticated = self.inner.session.is_authenticated();
        self.inner.session.clear();
        if was_authenticated {
            info!("Logged out");
            self.notify(SessionChange::SignedOut);
        }
    }

    /// Refresh the token pair now, regardless of expiry.
    pub async fn refresh_access_token(&self) -> Result<TokenPair, ApiError> {
        let Some(tokens) = self.inner.session.tokens() else {
            return Err(ApiError::SessionExpired(RefreshError::NoSession));
        };
        self.refresh_tokens(&tokens, true)
            .await
            .map_err(ApiError::SessionExpired)
    }

    /// Refresh `stale`, or reuse the outcome of a refresh already in flight.
    ///
    /// Only the caller that performs a failed refresh clears the session and
    /// reports [`SessionChange::Expired`].
    async fn refresh_tokens(&self, stale: &TokenPair, force: bool) -> Result<TokenPair, RefreshError> {
        let lock = &self.inner.refresh_lock;
        let Ok(mut guard) = lock.try_lock() else {
            debug!("Token refresh already in flight, waiting for it");
            let outcome = lock.lock().await.clone();
            return outcome.and_then(|()| self.inner.session.tokens().ok_or(RefreshError::NoSession));
        };

        let Some(current) = self.inner.session.data() else {
            *guard = Err(RefreshError::NoSession);
            return Err(RefreshError::NoSession);
        };

        if !force && current.tokens.access != stale.access && !self.is_expired(&current.identity) {
            debug!("Tokens were refreshed by another request");
            *guard = Ok(());
            return Ok(current.tokens);
        }

        info!(user_id = %current.identity.user_id, "Refreshing access token");
        let outcome = match self.exchange_refresh_token(&current.tokens.refresh).await {
            Ok(tokens) => match self.inner.session.set(tokens.clone()) {
                Some(_) => Ok(tokens),
                None => Err(RefreshError::UndecodableToken),
            },
            Err(e) => Err(e),
        };
        *guard = outcome.as_ref().map(|_| ()).map_err(|e| e.clone());

        match outcome {
            Ok(tokens) => {
                info!("Access token refreshed");
                self.notify(SessionChange::TokensRefreshed);
                Ok(tokens)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, session expired");
                self.inner.session.clear();
                self.notify(SessionChange::Expired);
                Err(e)
            }
        }
    }

    async fn exchange_refresh_token(&self, refresh: &str) -> Result<TokenPair, RefreshError> {
        let url = self.url(&self.inner.config.refresh_path);

        let response = self
            .inner
            .http
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest { refresh })
            .send()
            .await
            .map_err(|e| RefreshError::Network(Arc::new(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body: ApiError::truncate_body(&body),
            });
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        Ok(TokenPair {
            access: refreshed.access,
            refresh: refreshed.refresh.unwrap_or_else(|| refresh.to_string()),
        })
    }

    /// Access token to send, refreshing first if it has expired.
    async fn bearer_token(&self) -> Result<Option<String>, ApiError> {
        let Some(session) = self.inner.session.data() else {
            return Ok(None);
        };

        if !self.is_expired(&session.identity) {
            return Ok(Some(session.tokens.access));
        }

        debug!(expires_at = session.identity.expires_at, "Access token expired");
        match self.refresh_tokens(&session.tokens, false).await {
            Ok(tokens) => Ok(Some(tokens.access)),
            // Logged out while waiting; go out unauthenticated
            Err(RefreshError::NoSession) => Ok(None),
            Err(e) => Err(ApiError::SessionExpired(e)),
        }
    }

    // ===== Requests =====

    /// Send `request` with the current credentials.
    ///
    /// The response is returned whatever its status. Fails without sending
    /// when the access token had expired and could not be refreshed.
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let ApiRequest {
            method,
            path,
            mut headers,
            body,
        } = request;

        if let Some(token) = self.bearer_token().await? {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidRequest("Access token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let url = self.url(&path);
        debug!(%method, url = %url, "Sending request");

        let builder = self.inner.http.request(method, &url).headers(headers);
        let builder = match body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes),
            None => builder,
        };

        let response = builder.send().await?;
        debug!(status = %response.status(), url = %url, "Response received");
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = Self::check_response(self.send(request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e)))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::put(path).json(body)?).await
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        Self::check_response(self.send(ApiRequest::delete(path)).await?).await?;
        Ok(())
    }
}
