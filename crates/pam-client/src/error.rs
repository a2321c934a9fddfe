//! Error taxonomy shared by the gateway, the lifecycle controller, the live
//! channel and the replay engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PamError {
    /// The refresh token was rejected too; the user has to log in again.
    #[error("session expired, log in again")]
    AuthExpired,

    /// No usable credentials at all.
    #[error("not authenticated")]
    Unauthorized,

    /// Authenticated but lacking a capability or a valid step-up code.
    /// Carries the server's message verbatim.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel error: {0}")]
    Channel(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PamError>;

impl PamError {
    /// Classify a non-success HTTP status. 401 is only reached here when the
    /// gateway has already broadcast the unauthorized signal.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => PamError::Unauthorized,
            403 => PamError::Forbidden(message),
            400 | 409 => PamError::Conflict(message),
            404 => PamError::NotFound(message),
            _ => PamError::Api { status, message },
        }
    }

    /// Errors that end the authenticated session rather than a single action.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PamError::AuthExpired | PamError::Unauthorized)
    }
}

impl From<url::ParseError> for PamError {
    fn from(err: url::ParseError) -> Self {
        PamError::Config(format!("invalid URL: {err}"))
    }
}

/// Extract a human-readable message from an error response body.
///
/// The API reports failures as `{"detail": "..."}` or, for validation
/// errors, `{"detail": [{"msg": "..."}, ...]}`. Anything else that parses as
/// JSON is returned as compact JSON; a non-JSON body falls back to
/// `"<status> <reason>"`.
pub fn detail_message(status: u16, reason: &str, body: &[u8]) -> String {
    let fallback = || format!("{} {}", status, reason).trim_end().to_string();
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return fallback(),
    };
    match value.get("detail") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item.get("msg") {
                Some(serde_json::Value::String(msg)) => msg.clone(),
                _ => match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => value.to_string(),
    }
}
