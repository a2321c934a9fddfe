//! Authenticated request gateway.
//!
//! Every REST call goes through [`Gateway`]: it attaches the bearer token,
//! and when the API answers 401 it exchanges the refresh token once and
//! re-issues the call once. When that is not possible the gateway broadcasts
//! an [`AuthSignal`] so the owner of the session state can drop it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, Credentials, Identity};
use crate::error::{detail_message, PamError, Result};

pub const MFA_HEADER: &str = "X-MFA-TOTP";
const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const REFRESH_PATH: &str = "/auth/refresh";
const SIGNAL_CAPACITY: usize = 16;

// ── Request / response ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, starting with `/`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self.header("Content-Type", "application/json"))
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub reason: String,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The error this response represents, with the server's detail message.
    pub fn error(&self) -> PamError {
        PamError::from_status(self.status, detail_message(self.status, &self.reason, &self.body))
    }

    pub fn into_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.error())
        }
    }
}

/// Body of `/auth/login`, `/auth/register` and `/auth/refresh` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: Identity,
}

impl AuthResponse {
    fn credentials(&self) -> Credentials {
        Credentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    email: &'a str,
    password: &'a str,
    is_admin: bool,
}

#[derive(Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

// ── Transport seam ──────────────────────────────────────────────────

/// Sends one HTTP request. Implementations never retry and never touch
/// credentials.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body,
        })
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Broadcast when the gateway gives up on authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSignal {
    /// A refresh was attempted and did not produce usable credentials.
    Expired,
    /// A 401 arrived and there was no refresh token to try.
    Missing,
}

struct Outcome {
    response: ApiResponse,
    signal: Option<AuthSignal>,
}

pub struct Gateway {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn CredentialStore>,
    signals: broadcast::Sender<AuthSignal>,
}

impl Gateway {
    pub fn new(transport: Arc<dyn HttpTransport>, store: Arc<dyn CredentialStore>) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            transport,
            store,
            signals,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Subscribe to unauthorized notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthSignal> {
        self.signals.subscribe()
    }

    /// Issue `request` with the current bearer token and return the response
    /// as-is. At most one refresh and one retry happen per call.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        Ok(self.execute(request).await?.response)
    }

    /// Like [`Gateway::request`] but turns every non-success status into a
    /// [`PamError`]. A broadcast auth failure becomes `AuthExpired` or
    /// `Unauthorized`.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        let outcome = self.execute(request).await?;
        match outcome.signal {
            Some(AuthSignal::Expired) => Err(PamError::AuthExpired),
            Some(AuthSignal::Missing) => Err(PamError::Unauthorized),
            None => outcome.response.into_success(),
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        self.call(request).await?.json()
    }

    async fn execute(&self, request: ApiRequest) -> Result<Outcome> {
        let credentials = self.store.get();
        let response = self.send_authorized(&request, credentials.as_ref()).await?;
        if !response.is_unauthorized() {
            return Ok(Outcome {
                response,
                signal: None,
            });
        }

        let refresh_token = credentials
            .map(|c| c.refresh_token)
            .filter(|token| !token.is_empty());
        let Some(refresh_token) = refresh_token else {
            self.broadcast(AuthSignal::Missing);
            return Ok(Outcome {
                response,
                signal: Some(AuthSignal::Missing),
            });
        };

        debug!(path = %request.path, "access token rejected, refreshing");
        let refreshed = match self.exchange_refresh_token(&refresh_token).await {
            Ok(auth) => auth,
            // Transport failures are not a verdict on the token.
            Err(e @ PamError::Http(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                self.broadcast(AuthSignal::Expired);
                return Ok(Outcome {
                    response,
                    signal: Some(AuthSignal::Expired),
                });
            }
        };

        let renewed = refreshed.credentials();
        self.store.set(renewed.clone(), Some(refreshed.user))?;
        info!(path = %request.path, "token refreshed, retrying request");

        let retried = self.send_authorized(&request, Some(&renewed)).await?;
        if retried.is_unauthorized() {
            warn!(path = %request.path, "request still unauthorized after refresh");
            self.broadcast(AuthSignal::Expired);
            return Ok(Outcome {
                response: retried,
                signal: Some(AuthSignal::Expired),
            });
        }
        Ok(Outcome {
            response: retried,
            signal: None,
        })
    }

    async fn send_authorized(
        &self,
        request: &ApiRequest,
        credentials: Option<&Credentials>,
    ) -> Result<ApiResponse> {
        let mut outgoing = request.clone();
        if let Some(c) = credentials.filter(|c| !c.access_token.is_empty()) {
            outgoing
                .headers
                .push(("Authorization".to_string(), format!("Bearer {}", c.access_token)));
        }
        self.transport.send(outgoing).await
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<AuthResponse> {
        let request = ApiRequest::post(REFRESH_PATH).json(&RefreshBody { refresh_token })?;
        let response = self.transport.send(request).await?.into_success()?;
        response.json()
    }

    fn broadcast(&self, signal: AuthSignal) {
        let receivers = self.signals.send(signal).unwrap_or(0);
        info!(?signal, receivers, "broadcasting unauthorized");
    }

    // ── Login / logout ──────────────────────────────────────────────

    /// Exchange email/password for a token pair and cache it with the
    /// returned identity.
    pub async fn login(&self, email: &str, password: &str) -> Result<Identity> {
        let request = ApiRequest::post(LOGIN_PATH).json(&LoginBody { email, password })?;
        self.authenticate(request).await
    }

    pub async fn register(&self, email: &str, password: &str, is_admin: bool) -> Result<Identity> {
        let request = ApiRequest::post(REGISTER_PATH).json(&RegisterBody {
            email,
            password,
            is_admin,
        })?;
        self.authenticate(request).await
    }

    async fn authenticate(&self, request: ApiRequest) -> Result<Identity> {
        let path = request.path.clone();
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            // A 401 here is a bad password, not an expired session.
            return Err(PamError::Api {
                status: response.status,
                message: detail_message(response.status, &response.reason, &response.body),
            });
        }
        let auth: AuthResponse = response.json()?;
        self.store.set(auth.credentials(), Some(auth.user.clone()))?;
        info!(path = %path, user_id = auth.user.id, "authenticated");
        Ok(auth.user)
    }

    pub fn logout(&self) -> Result<()> {
        self.store.clear()?;
        info!("logged out");
        Ok(())
    }

    /// Re-read the identity after a self-mutating action (e.g. enabling
    /// MFA). Replaces both the token pair and the cached identity.
    pub async fn refresh_identity(&self) -> Result<Identity> {
        let Some(credentials) = self.store.get() else {
            return Err(PamError::Unauthorized);
        };
        // Goes straight to the refresh exchange: a rejected token must not
        // trigger a second refresh through the retry path.
        let auth = match self.exchange_refresh_token(&credentials.refresh_token).await {
            Ok(auth) => auth,
            Err(e @ PamError::Http(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "identity refresh rejected");
                self.broadcast(AuthSignal::Expired);
                return Err(PamError::AuthExpired);
            }
        };
        self.store.set(auth.credentials(), Some(auth.user.clone()))?;
        Ok(auth.user)
    }
}

// ── Test fakes ──────────────────────────────────────────────────────
