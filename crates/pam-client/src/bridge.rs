//! Live terminal bridge.
//!
//! One WebSocket per active session. Output frames from the remote side are
//! written to the terminal surface in arrival order; input bytes are sent as
//! binary frames in the order they were typed, and only while the channel is
//! open. The session credential travels as the `token` query parameter.
//!
//! There is no reconnect: a transport error or remote close leaves the
//! bridge `Closed`. Resizes are fitted locally and not forwarded.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{PamError, Result};
use crate::lifecycle::SessionTicket;
use crate::surface::{SurfaceSlot, TerminalSurface};

// ── Frames and status ───────────────────────────────────────────────

/// An output frame as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    /// Map a WebSocket message to an output frame; control messages yield
    /// `None`.
    pub fn from_message(message: Message) -> Option<Frame> {
        match message {
            Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
            Message::Text(text) => Some(Frame::Text(text.as_str().to_string())),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Frame::Binary(data) => data,
            Frame::Text(text) => text.into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Connecting => "Connecting...",
            ChannelStatus::Open => "Connected",
            ChannelStatus::Closed => "Disconnected",
        };
        f.write_str(s)
    }
}

/// `channel_address?token=<credential>`, keeping any existing query.
pub fn channel_url(channel_address: &str, session_credential: &str) -> Result<Url> {
    let mut url = Url::parse(channel_address)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(PamError::Config(format!(
            "channel address must be ws or wss, got {}",
            url.scheme()
        )));
    }
    url.query_pairs_mut().append_pair("token", session_credential);
    Ok(url)
}

// ── Bridge ──────────────────────────────────────────────────────────

pub struct LiveBridge;

impl LiveBridge {
    /// Open the live channel for `ticket` and render its output on
    /// `surface`. Must be called from within a tokio runtime.
    pub fn open<S: TerminalSurface>(ticket: &SessionTicket, surface: S) -> Result<BridgeHandle<S>> {
        Self::open_address(&ticket.channel_address, &ticket.session_credential, surface)
    }

    pub fn open_address<S: TerminalSurface>(
        channel_address: &str,
        session_credential: &str,
        surface: S,
    ) -> Result<BridgeHandle<S>> {
        let url = channel_url(channel_address, session_credential)?;
        let surface = SurfaceSlot::new(surface);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(drive_channel(
            url,
            surface.clone(),
            status_tx,
            input_rx,
            cancel.clone(),
        ));

        Ok(BridgeHandle {
            surface,
            status_rx,
            input_tx,
            cancel,
            closed: AtomicBool::new(false),
            task: Some(task),
        })
    }
}

/// Owner of one live channel. Dropping the handle closes the channel and
/// disposes the surface, so every exit path tears down.
pub struct BridgeHandle<S: TerminalSurface> {
    surface: SurfaceSlot<S>,
    status_rx: watch::Receiver<ChannelStatus>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: Option<JoinHandle<()>>,
}

impl<S: TerminalSurface> BridgeHandle<S> {
    pub fn status(&self) -> ChannelStatus {
        *self.status_rx.borrow()
    }

    /// A receiver that observes every status change.
    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    /// Run `callback` on each status change until the channel is closed.
    pub fn on_status_change<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ChannelStatus) + Send + 'static,
    {
        let mut rx = self.status_rx.clone();
        tokio::spawn(async move {
            callback(*rx.borrow_and_update());
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                callback(status);
                if status == ChannelStatus::Closed {
                    break;
                }
            }
        })
    }

    /// Forward input bytes verbatim. Input while the channel is not open is
    /// dropped; returns whether it was accepted.
    pub fn send_input(&self, data: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.status() != ChannelStatus::Open {
            debug!(bytes = data.len(), "dropping input, channel not open");
            return false;
        }
        self.input_tx.send(data.to_vec()).is_ok()
    }

    /// Re-fit the surface after a viewport change.
    pub fn refit(&self) {
        self.surface.fit();
    }

    /// Close the channel and dispose the surface. Idempotent; no surface
    /// write happens once this returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.surface.dispose();
        debug!("live bridge closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the channel reaches `Closed`, whoever closed it.
    pub async fn wait_closed(&mut self) {
        let _ = self
            .status_rx
            .wait_for(|s| *s == ChannelStatus::Closed)
            .await;
    }

    /// Close and wait for the background task to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<S: TerminalSurface> Drop for BridgeHandle<S> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive_channel<S: TerminalSurface>(
    url: Url,
    surface: SurfaceSlot<S>,
    status_tx: watch::Sender<ChannelStatus>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let host = url.host_str().unwrap_or("").to_string();
    debug!(host = %host, "connecting live channel");

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            status_tx.send_replace(ChannelStatus::Closed);
            return;
        }
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };
    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(host = %host, error = %e, "live channel failed to connect");
            status_tx.send_replace(ChannelStatus::Closed);
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    status_tx.send_replace(ChannelStatus::Open);
    info!(host = %host, "live channel open");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "remote closed live channel");
                    break;
                }
                Some(Ok(message)) => {
                    if let Some(frame) = Frame::from_message(message) {
                        surface.write(&frame.into_bytes());
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "live channel error");
                    break;
                }
                None => break,
            },
            input = input_rx.recv() => match input {
                Some(data) => {
                    if let Err(e) = sink.send(Message::Binary(data.into())).await {
                        warn!(error = %e, "failed to send input");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    status_tx.send_replace(ChannelStatus::Closed);
    info!(host = %host, "live channel closed");
}
