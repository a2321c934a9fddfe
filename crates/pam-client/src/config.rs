//! Client configuration: API location, local data directory, log filter.

use std::env;
use std::path::PathBuf;

use url::Url;

use crate::error::{PamError, Result};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_LOG_LEVEL: &str = "warn";
const DATA_DIR_NAME: &str = ".pam-client";
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the API, without a trailing slash.
    pub api_url: String,
    /// Directory holding the durable credential file.
    pub data_dir: PathBuf,
    /// `tracing` filter directive.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            data_dir: default_data_dir(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_url: &str, data_dir: Option<PathBuf>, log_level: &str) -> Result<Self> {
        let parsed = Url::parse(api_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PamError::Config(format!(
                "API URL must be http or https, got {}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            log_level: log_level.to_string(),
        })
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILE)
    }

    /// Address of the admin live-update feed: the API URL with its scheme
    /// switched to ws/wss and `/ws/updates` appended.
    pub fn updates_url(&self) -> Result<Url> {
        let ws_base = if let Some(rest) = self.api_url.strip_prefix("https") {
            format!("wss{rest}")
        } else if let Some(rest) = self.api_url.strip_prefix("http") {
            format!("ws{rest}")
        } else {
            self.api_url.clone()
        };
        Ok(Url::parse(&format!("{ws_base}/ws/updates"))?)
    }
}

/// `$HOME/.pam-client`, or `./.pam-client` when HOME is unset.
pub fn default_data_dir() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(DATA_DIR_NAME)
}
