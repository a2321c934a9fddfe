//! Admin live-update feed.
//!
//! The API pushes `{"type": "...", "session_id": N}` notices on `/ws/updates`
//! whenever a request or session changes. They carry no payload beyond the
//! ids; consumers re-fetch what they display.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::config::ClientConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub session_id: Option<i64>,
}

impl UpdateEvent {
    /// Parse one text frame. Anything that is not an update notice yields
    /// `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "ignoring update frame");
                None
            }
        }
    }
}

pub struct UpdatesFeed {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl UpdatesFeed {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        Self::connect_url(&config.updates_url()?).await
    }

    pub async fn connect_url(url: &Url) -> Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!(url = %url, "update feed connected");
        Ok(Self { ws })
    }

    /// Next update notice. `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<Result<UpdateEvent>> {
        while let Some(message) = self.ws.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_string(),
                Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            };
            if let Some(event) = UpdateEvent::parse(&text) {
                return Some(Ok(event));
            }
        }
        None
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
