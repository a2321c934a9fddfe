//! JIT request lifecycle and session brokering.
//!
//! A request moves `PENDING -> APPROVED | DENIED` by an admin decision (with
//! a step-up MFA code), and `APPROVED -> EXPIRED` purely by time. A session
//! can only be started from an approved, unexpired request; the resulting
//! one-time ticket is kept in memory for this process only.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialStore, Identity};
use crate::error::{PamError, Result};
use crate::gateway::{ApiRequest, Gateway, MFA_HEADER};

pub const DEFAULT_COMMAND_LIMIT: u32 = 200;
pub const MAX_COMMAND_LIMIT: u32 = 1000;

// ── Server timestamps ───────────────────────────────────────────────

/// The API emits ISO-8601 datetimes, sometimes without an offset. Naive
/// values are UTC.
mod server_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime: {s}"))),
        }
    }
}

// ── JIT requests ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JitStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl JitStatus {
    /// DENIED and EXPIRED never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JitStatus::Denied | JitStatus::Expired)
    }
}

impl fmt::Display for JitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JitStatus::Pending => "PENDING",
            JitStatus::Approved => "APPROVED",
            JitStatus::Denied => "DENIED",
            JitStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JitRequest {
    pub id: i64,
    pub user_id: i64,
    pub asset_id: i64,
    pub role_id: i64,
    #[serde(default)]
    pub reason: String,
    pub duration_minutes: i64,
    pub status: JitStatus,
    #[serde(default)]
    pub approved_by: Option<i64>,
    #[serde(default, deserialize_with = "server_time::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "server_time::deserialize")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl JitRequest {
    /// Status with time-based expiry applied: an approved request whose
    /// `expires_at` has passed is EXPIRED even if the server still says
    /// APPROVED.
    pub fn effective_status(&self, now: DateTime<Utc>) -> JitStatus {
        match (self.status, self.expires_at) {
            (JitStatus::Approved, Some(expires_at)) if expires_at <= now => JitStatus::Expired,
            (status, _) => status,
        }
    }

    pub fn can_start_session(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == JitStatus::Approved
    }
}

/// Body of `POST /jit-requests`.
#[derive(Debug, Clone, Serialize)]
pub struct NewJitRequest {
    pub asset_id: i64,
    pub role_id: i64,
    pub reason: String,
    pub duration_minutes: i64,
}

// ── Sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    #[serde(alias = "ENDED")]
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Closed => "CLOSED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Session {
    pub id: i64,
    pub jit_request_id: i64,
    pub status: SessionStatus,
    #[serde(default, deserialize_with = "server_time::deserialize")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "server_time::deserialize")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recording_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandLogEntry {
    pub ts: f64,
    pub line: String,
}

/// One-time admission ticket for the live channel of a started session.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct SessionTicket {
    pub session_id: i64,
    #[serde(rename = "session_token")]
    pub session_credential: String,
    #[serde(rename = "websocket_url")]
    pub channel_address: String,
}

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTicket")
            .field("session_id", &self.session_id)
            .field("session_credential", &"<redacted>")
            .field("channel_address", &self.channel_address)
            .finish()
    }
}

#[derive(Serialize)]
struct StartSessionBody {
    jit_request_id: i64,
}

/// Tickets of sessions started by this process. Never persisted.
#[derive(Default)]
pub struct SessionTickets {
    tickets: Mutex<HashMap<i64, SessionTicket>>,
}

impl SessionTickets {
    pub fn insert(&self, ticket: SessionTicket) {
        self.lock().insert(ticket.session_id, ticket);
    }

    pub fn get(&self, session_id: i64) -> Option<SessionTicket> {
        self.lock().get(&session_id).cloned()
    }

    pub fn remove(&self, session_id: i64) -> Option<SessionTicket> {
        self.lock().remove(&session_id)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SessionTicket>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Controller ──────────────────────────────────────────────────────

pub struct SessionController {
    gateway: Arc<Gateway>,
    tickets: SessionTickets,
}

impl SessionController {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            tickets: SessionTickets::default(),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn tickets(&self) -> &SessionTickets {
        &self.tickets
    }

    fn store(&self) -> &Arc<dyn CredentialStore> {
        self.gateway.store()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.store().identity()
    }

    /// Whether approve/deny should be offered. A UX hint only: the server
    /// decides who is an admin.
    pub fn can_decide(&self) -> bool {
        self.identity().is_some_and(|i| i.is_admin)
    }

    // ── Requests ────────────────────────────────────────────────────

    pub async fn submit_request(&self, request: &NewJitRequest) -> Result<JitRequest> {
        let created: JitRequest = self
            .gateway
            .fetch_json(ApiRequest::post("/jit-requests").json(request)?)
            .await?;
        info!(jit_request_id = created.id, asset_id = created.asset_id, "JIT request submitted");
        Ok(created)
    }

    /// All requests visible to the caller, in server order.
    pub async fn list_requests(&self) -> Result<Vec<JitRequest>> {
        self.gateway.fetch_json(ApiRequest::get("/jit-requests")).await
    }

    /// The approvals queue: requests still waiting for a decision.
    pub async fn pending_queue(&self) -> Result<Vec<JitRequest>> {
        let requests = self.list_requests().await?;
        Ok(requests
            .into_iter()
            .filter(|r| r.status == JitStatus::Pending)
            .collect())
    }

    /// Requests a session can be started from right now, soonest expiry
    /// first. Non-admins only see their own.
    pub async fn startable_requests(&self, now: DateTime<Utc>) -> Result<Vec<JitRequest>> {
        let identity = self.identity();
        let requests = self.list_requests().await?;
        Ok(startable(requests, identity.as_ref(), now))
    }

    pub async fn approve(&self, jit_request_id: i64, mfa_code: &str) -> Result<JitRequest> {
        self.decide(jit_request_id, "approve", mfa_code).await
    }

    pub async fn deny(&self, jit_request_id: i64, mfa_code: &str) -> Result<JitRequest> {
        self.decide(jit_request_id, "deny", mfa_code).await
    }

    async fn decide(&self, jit_request_id: i64, action: &str, mfa_code: &str) -> Result<JitRequest> {
        let request = ApiRequest::post(format!("/jit-requests/{jit_request_id}/{action}"))
            .header(MFA_HEADER, mfa_code);
        let decided: JitRequest = self.gateway.fetch_json(request).await?;
        info!(jit_request_id, action, status = %decided.status, "JIT request decided");
        Ok(decided)
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Start a session from `jit_request_id`. Server rejections (already
    /// active, expired, denied meanwhile) are returned as-is; nothing is
    /// retried.
    pub async fn start_session(&self, jit_request_id: i64) -> Result<SessionTicket> {
        let request =
            ApiRequest::post("/sessions/start").json(&StartSessionBody { jit_request_id })?;
        let ticket: SessionTicket = self.gateway.fetch_json(request).await?;
        info!(jit_request_id, session_id = ticket.session_id, "session started");
        self.tickets.insert(ticket.clone());
        Ok(ticket)
    }

    /// Start a session from a request the caller already holds, refusing
    /// locally when it is not approved or has expired.
    pub async fn start_session_for(
        &self,
        request: &JitRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionTicket> {
        let status = request.effective_status(now);
        if status != JitStatus::Approved {
            return Err(PamError::Conflict(format!(
                "JIT request {} is {}, not APPROVED",
                request.id, status
            )));
        }
        self.start_session(request.id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.gateway.fetch_json(ApiRequest::get("/sessions")).await
    }

    /// The last `limit` commands typed in a session (clamped to 1..=1000).
    pub async fn command_log(&self, session_id: i64, limit: Option<u32>) -> Result<Vec<CommandLogEntry>> {
        let limit = limit
            .unwrap_or(DEFAULT_COMMAND_LIMIT)
            .clamp(1, MAX_COMMAND_LIMIT);
        self.gateway
            .fetch_json(ApiRequest::get(format!("/sessions/{session_id}/commands?limit={limit}")))
            .await
    }

    /// Ticket for a session started by this process.
    pub fn ticket(&self, session_id: i64) -> Result<SessionTicket> {
        self.tickets.get(session_id).ok_or_else(|| {
            PamError::NotFound(format!(
                "missing session ticket for session {session_id}; start the session first"
            ))
        })
    }

    // ── Auth state ──────────────────────────────────────────────────

    pub fn logout(&self) -> Result<()> {
        self.tickets.clear();
        self.gateway.logout()
    }

    /// Drop every piece of local session state.
    pub fn on_unauthorized(&self) {
        self.tickets.clear();
        if let Err(e) = self.store().clear() {
            warn!(error = %e, "failed to clear credentials");
        }
    }

    /// Subscribe to the gateway's unauthorized signal and clear local state
    /// whenever it fires.
    pub fn spawn_unauthorized_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut signals = self.gateway.subscribe();
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        debug!(?signal, "clearing local session state");
                        controller.on_unauthorized();
                    }
                    Err(RecvError::Lagged(_)) => controller.on_unauthorized(),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn startable(requests: Vec<JitRequest>, identity: Option<&Identity>, now: DateTime<Utc>) -> Vec<JitRequest> {
    let mut out: Vec<JitRequest> = requests
        .into_iter()
        .filter(|r| r.can_start_session(now))
        .filter(|r| match identity {
            Some(user) if !user.is_admin => r.user_id == user.id,
            _ => true,
        })
        .collect();
    // None sorts first, matching a missing expiry treated as epoch.
    out.sort_by_key(|r| r.expires_at);
    out
}
