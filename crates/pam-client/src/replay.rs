//! Session replay.
//!
//! A finished session's recording is newline-delimited JSON, one
//! `{"ts": <float seconds>, "data": <base64>}` object per chunk of terminal
//! output. Playback writes each chunk at `max(0, ts - ts_first)` after start.
//!
//! Chunks are timed independently of each other: one timer task walks a
//! min-heap keyed by (delay, position), which fires in the same order as a
//! separate timer per chunk would. A log that is out of order is not
//! re-sorted; chunks earlier than the first one play immediately.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PamError, Result};
use crate::gateway::{ApiRequest, Gateway};
use crate::surface::{SurfaceSlot, TerminalSurface};

/// Time between the last chunk and `Finished`.
pub const FINISH_GRACE: Duration = Duration::from_millis(150);

/// Longest playback accepted. Anything later is treated as a corrupt log.
pub const MAX_PLAYBACK_SPAN: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// ── Recording format ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingEntry {
    pub ts: f64,
    pub data: Vec<u8>,
}

#[derive(Deserialize)]
struct RawEntry {
    ts: f64,
    data: String,
}

/// Parse a whole recording. Blank lines are skipped; any bad line fails
/// the whole recording so nothing is played partially.
pub fn parse_recording(text: &str) -> Result<Vec<RecordingEntry>> {
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawEntry = serde_json::from_str(line)
            .map_err(|e| PamError::Malformed(format!("line {}: {}", index + 1, e)))?;
        let data = BASE64
            .decode(raw.data.as_bytes())
            .map_err(|e| PamError::Malformed(format!("line {}: bad base64: {}", index + 1, e)))?;
        entries.push(RecordingEntry { ts: raw.ts, data });
    }
    Ok(entries)
}

/// Delay of each entry relative to playback start: `max(0, ts - ts_first)`.
pub fn schedule(entries: &[RecordingEntry]) -> Vec<Duration> {
    let Some(first) = entries.first() else {
        return Vec::new();
    };
    let t0 = first.ts;
    entries.iter().map(|e| delay_between(t0, e.ts)).collect()
}

/// Offset of the latest chunk, rejecting schedules past [`MAX_PLAYBACK_SPAN`].
pub fn playback_span(delays: &[Duration]) -> Result<Duration> {
    let span = delays.iter().max().copied().unwrap_or_default();
    if span > MAX_PLAYBACK_SPAN {
        return Err(PamError::Malformed(format!(
            "recording spans {}s, limit is {}s",
            span.as_secs(),
            MAX_PLAYBACK_SPAN.as_secs()
        )));
    }
    Ok(span)
}

fn delay_between(t0: f64, ts: f64) -> Duration {
    let delta = ts - t0;
    if delta.is_finite() && delta > 0.0 {
        Duration::try_from_secs_f64(delta).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

/// Pending writes ordered by (delay, position in the log).
struct PlaybackQueue {
    heap: BinaryHeap<Reverse<(Duration, usize)>>,
}

impl PlaybackQueue {
    fn new(delays: &[Duration]) -> Self {
        let heap = delays
            .iter()
            .enumerate()
            .map(|(seq, delay)| Reverse((*delay, seq)))
            .collect();
        Self { heap }
    }

    fn pop(&mut self) -> Option<(Duration, usize)> {
        self.heap.pop().map(|Reverse(item)| item)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

// ── Recording files ─────────────────────────────────────────────────

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Read a recording saved by [`write_recording_file`]; `.gz` files are
/// decompressed.
pub fn read_recording_file(path: &Path) -> Result<String> {
    let raw = fs::read(path)?;
    if is_gzip(path) {
        let mut decoder = GzDecoder::new(&raw[..]);
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        Ok(text)
    } else {
        String::from_utf8(raw).map_err(|e| PamError::Malformed(e.to_string()))
    }
}

/// Save a recording; a `.gz` path is written gzip-compressed.
pub fn write_recording_file(path: &Path, text: &str) -> Result<()> {
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        fs::write(path, encoder.finish()?)?;
    } else {
        fs::write(path, text)?;
    }
    Ok(())
}

// ── Engine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Loading,
    Playing,
    Finished,
    /// The recording could not be fetched or read.
    Unavailable,
    /// The recording exists but holds no output.
    Empty,
}

impl ReplayStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReplayStatus::Finished | ReplayStatus::Unavailable | ReplayStatus::Empty
        )
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplayStatus::Loading => "Loading recording...",
            ReplayStatus::Playing => "Playing",
            ReplayStatus::Finished => "Playback finished.",
            ReplayStatus::Unavailable => "Recording not available.",
            ReplayStatus::Empty => "Recording empty.",
        };
        f.write_str(s)
    }
}

pub struct ReplayEngine {
    gateway: Arc<Gateway>,
}

impl ReplayEngine {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Fetch the raw recording text of a session.
    pub async fn fetch_recording(&self, session_id: i64) -> Result<String> {
        fetch_recording(&self.gateway, session_id).await
    }

    /// Play a session's recording on `surface`.
    pub fn play<S: TerminalSurface>(&self, session_id: i64, surface: S) -> ReplayHandle<S> {
        let gateway = Arc::clone(&self.gateway);
        ReplayHandle::spawn(
            async move { fetch_recording(&gateway, session_id).await },
            surface,
        )
    }

    /// Download a recording to `path` (gzip when it ends in `.gz`). Returns
    /// the number of entries.
    pub async fn export_recording(&self, session_id: i64, path: &Path) -> Result<usize> {
        let text = self.fetch_recording(session_id).await?;
        let entries = parse_recording(&text)?;
        write_recording_file(path, &text)?;
        info!(session_id, entries = entries.len(), path = %path.display(), "recording exported");
        Ok(entries.len())
    }
}

async fn fetch_recording(gateway: &Gateway, session_id: i64) -> Result<String> {
    let response = gateway
        .call(ApiRequest::get(format!("/sessions/{session_id}/recording")))
        .await?;
    Ok(response.text())
}

/// Play a recording saved on disk.
pub fn play_file<S: TerminalSurface>(path: &Path, surface: S) -> ReplayHandle<S> {
    let path = path.to_path_buf();
    ReplayHandle::spawn(async move { read_recording_file(&path) }, surface)
}

/// Play recording text already in memory.
pub fn play_text<S: TerminalSurface>(text: String, surface: S) -> ReplayHandle<S> {
    ReplayHandle::spawn(async move { Ok(text) }, surface)
}

/// Owner of one playback. Dropping it cancels every pending write and
/// disposes the surface.
pub struct ReplayHandle<S: TerminalSurface> {
    surface: SurfaceSlot<S>,
    status_rx: watch::Receiver<ReplayStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: TerminalSurface> ReplayHandle<S> {
    /// Load the recording with `load`, then play it. Must be called from
    /// within a tokio runtime.
    pub fn spawn<F>(load: F, surface: S) -> Self
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let surface = SurfaceSlot::new(surface);
        let (status_tx, status_rx) = watch::channel(ReplayStatus::Loading);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_playback(load, surface.clone(), status_tx, cancel.clone()));
        Self {
            surface,
            status_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn status(&self) -> ReplayStatus {
        *self.status_rx.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<ReplayStatus> {
        self.status_rx.clone()
    }

    pub fn refit(&self) {
        self.surface.fit();
    }

    /// Cancel every pending write and dispose the surface. Idempotent.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.surface.dispose();
        debug!("replay cancelled");
    }

    /// Wait for a terminal status. Returns the last status seen if the
    /// playback was cancelled first.
    pub async fn wait(&mut self) -> ReplayStatus {
        let mut rx = self.status_rx.clone();
        tokio::select! {
            result = rx.wait_for(|s| s.is_terminal()) => match result {
                Ok(status) => *status,
                Err(_) => *self.status_rx.borrow(),
            },
            _ = self.cancel.cancelled() => *self.status_rx.borrow(),
        }
    }

    /// Cancel and wait for the timer task to stop.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<S: TerminalSurface> Drop for ReplayHandle<S> {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_playback<S, F>(
    load: F,
    surface: SurfaceSlot<S>,
    status_tx: watch::Sender<ReplayStatus>,
    cancel: CancellationToken,
) where
    S: TerminalSurface,
    F: Future<Output = Result<String>>,
{
    let loaded = tokio::select! {
        _ = cancel.cancelled() => return,
        result = load => result,
    };
    let text = match loaded {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "recording unavailable");
            status_tx.send_replace(ReplayStatus::Unavailable);
            return;
        }
    };
    let entries = match parse_recording(&text) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "recording unreadable");
            status_tx.send_replace(ReplayStatus::Unavailable);
            return;
        }
    };
    if entries.is_empty() {
        status_tx.send_replace(ReplayStatus::Empty);
        return;
    }

    let delays = schedule(&entries);
    let span = match playback_span(&delays) {
        Ok(span) => span,
        Err(e) => {
            warn!(error = %e, "recording unreadable");
            status_tx.send_replace(ReplayStatus::Unavailable);
            return;
        }
    };
    let mut queue = PlaybackQueue::new(&delays);
    let start = Instant::now();
    status_tx.send_replace(ReplayStatus::Playing);
    debug!(entries = queue.len(), duration_ms = span.as_millis() as u64, "replay scheduled");

    while let Some((delay, seq)) = queue.pop() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = time::sleep_until(start + delay) => {
                if !surface.write(&entries[seq].data) {
                    return;
                }
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = time::sleep_until(start + span + FINISH_GRACE) => {}
    }
    status_tx.send_replace(ReplayStatus::Finished);
    info!(entries = entries.len(), "replay finished");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore};
    use crate::gateway::fake::*;
    use crate::surface::fake::RecordingSurface;

    fn line(ts: f64, data: &[u8]) -> String {
        json!({"ts": ts, "data": BASE64.encode(data)}).to_string()
    }

    fn recording(entries: &[(f64, &[u8])]) -> String {
        entries
            .iter()
            .map(|(ts, data)| line(*ts, data))
            .collect::<Vec<_>>()
            .join("\n")
            + "\n"
    }

    #[test]
    fn parses_and_decodes() {
        let text = format!("{}\n\n{}\n", line(1.0, b"a\x1b[0m"), line(1.25, b"b"));
        let entries = parse_recording(&text).unwrap();
        assert_eq!(
            entries,
            vec![
                RecordingEntry { ts: 1.0, data: b"a\x1b[0m".to_vec() },
                RecordingEntry { ts: 1.25, data: b"b".to_vec() },
            ]
        );
        assert!(parse_recording("").unwrap().is_empty());
        assert!(parse_recording("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn bad_line_fails_whole_recording() {
        let text = format!("{}\nnot json\n", line(1.0, b"a"));
        assert!(matches!(parse_recording(&text), Err(PamError::Malformed(m)) if m.starts_with("line 2")));

        let text = r#"{"ts": 1.0, "data": "***"}"#;
        assert!(matches!(parse_recording(text), Err(PamError::Malformed(_))));
    }

    #[test]
    fn schedule_is_relative_to_first_entry() {
        let entries = parse_recording(&recording(&[(10.0, b"A"), (10.5, b"B"), (12.0, b"C")])).unwrap();
        assert_eq!(
            schedule(&entries),
            vec![Duration::ZERO, Duration::from_millis(500), Duration::from_millis(2000)]
        );
    }

    #[test]
    fn negative_delays_clamp_to_zero() {
        let entries = parse_recording(&recording(&[(10.0, b"A"), (9.0, b"B"), (11.0, b"C")])).unwrap();
        assert_eq!(
            schedule(&entries),
            vec![Duration::ZERO, Duration::ZERO, Duration::from_secs(1)]
        );
        assert_eq!(delay_between(0.0, f64::NAN), Duration::ZERO);
        assert!(schedule(&[]).is_empty());
    }

    #[test]
    fn queue_orders_by_delay_then_position() {
        let delays = [
            Duration::from_millis(300),
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::ZERO,
        ];
        let mut queue = PlaybackQueue::new(&delays);
        let order: Vec<usize> = std::iter::from_fn(|| queue.pop().map(|(_, seq)| seq)).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn gzip_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let text = recording(&[(1.0, b"hello"), (2.0, b"world")]);

        let gz = dir.path().join("session-1.ndjson.gz");
        write_recording_file(&gz, &text).unwrap();
        assert_ne!(fs::read(&gz).unwrap(), text.as_bytes());
        assert_eq!(read_recording_file(&gz).unwrap(), text);

        let plain = dir.path().join("session-1.ndjson");
        write_recording_file(&plain, &text).unwrap();
        assert_eq!(read_recording_file(&plain).unwrap(), text);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_land_at_recorded_offsets() {
        let surface = RecordingSurface::default();
        let origin = Instant::now();
        let mut handle = play_text(
            recording(&[(10.0, b"A"), (10.5, b"B"), (12.0, b"C")]),
            surface.clone(),
        );

        assert_eq!(handle.wait().await, ReplayStatus::Finished);
        assert_eq!(surface.data(), vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
        let offsets: Vec<Duration> = surface.times().iter().map(|t| *t - origin).collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_millis(500), Duration::from_millis(2000)]
        );
        assert!(Instant::now() - origin >= Duration::from_millis(2000) + FINISH_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn status_moves_loading_playing_finished() {
        let surface = RecordingSurface::default();
        let handle = play_text(recording(&[(0.0, b"x"), (1.0, b"y")]), surface);
        let mut rx = handle.status_changes();
        assert_eq!(*rx.borrow_and_update(), ReplayStatus::Loading);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ReplayStatus::Playing);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ReplayStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_entry_plays_immediately() {
        let surface = RecordingSurface::default();
        let origin = Instant::now();
        let mut handle = play_text(
            recording(&[(10.0, b"A"), (9.0, b"early"), (10.2, b"B")]),
            surface.clone(),
        );
        assert_eq!(handle.wait().await, ReplayStatus::Finished);

        assert_eq!(surface.data(), vec![b"A".to_vec(), b"early".to_vec(), b"B".to_vec()]);
        let offsets: Vec<Duration> = surface.times().iter().map(|t| *t - origin).collect();
        assert_eq!(offsets[1], Duration::ZERO);
        assert_eq!(offsets[2], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_every_pending_write() {
        let surface = RecordingSurface::default();
        let handle = play_text(
            recording(&[(0.0, b"A"), (1.0, b"B"), (2.0, b"C"), (3.0, b"D")]),
            surface.clone(),
        );

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(surface.data(), vec![b"A".to_vec(), b"B".to_vec()]);

        handle.cancel();
        assert_eq!(surface.dispose_count(), 1);
        time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(surface.data().len(), 2);
        assert_ne!(handle.status(), ReplayStatus::Finished);
        drop(handle);
        assert_eq!(surface.dispose_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels() {
        let surface = RecordingSurface::default();
        let handle = play_text(recording(&[(0.0, b"A"), (5.0, b"B")]), surface.clone());
        time::sleep(Duration::from_millis(10)).await;
        drop(handle);

        time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(surface.data(), vec![b"A".to_vec()]);
        assert_eq!(surface.dispose_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_recording_schedules_nothing() {
        let surface = RecordingSurface::default();
        let mut handle = play_text("\n".to_string(), surface.clone());
        assert_eq!(handle.wait().await, ReplayStatus::Empty);
        assert!(surface.data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_recording_is_unavailable_without_partial_playback() {
        let surface = RecordingSurface::default();
        let text = format!("{}\n{{broken\n", line(0.0, b"A"));
        let mut handle = play_text(text, surface.clone());
        assert_eq!(handle.wait().await, ReplayStatus::Unavailable);
        assert!(surface.data().is_empty());
    }

    #[test]
    fn span_is_the_latest_offset_within_the_ceiling() {
        let delays = [Duration::ZERO, Duration::from_secs(5), Duration::from_secs(2)];
        assert_eq!(playback_span(&delays).unwrap(), Duration::from_secs(5));
        assert_eq!(playback_span(&[]).unwrap(), Duration::ZERO);
        assert!(playback_span(&[MAX_PLAYBACK_SPAN]).is_ok());

        let too_long = [Duration::ZERO, MAX_PLAYBACK_SPAN + Duration::from_secs(1)];
        assert!(matches!(playback_span(&too_long), Err(PamError::Malformed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn far_future_timestamp_is_unavailable_without_partial_playback() {
        let surface = RecordingSurface::default();
        let mut handle = play_text(recording(&[(0.0, b"A"), (1.5e19, b"B")]), surface.clone());
        assert_eq!(handle.wait().await, ReplayStatus::Unavailable);
        assert!(surface.data().is_empty());
    }

    fn engine(transport: Arc<ScriptedTransport>) -> ReplayEngine {
        let store = Arc::new(MemoryCredentialStore::with_credentials(
            Credentials {
                access_token: "access-1".to_string(),
                refresh_token: "refresh-1".to_string(),
            },
            None,
        ));
        ReplayEngine::new(Arc::new(Gateway::new(transport, store)))
    }

    #[tokio::test(start_paused = true)]
    async fn missing_recording_is_unavailable() {
        let transport = ScriptedTransport::new(|request| {
            assert_eq!(request.path, "/sessions/3/recording");
            respond(404, json!({"detail": "Recording file missing"}))
        });
        let surface = RecordingSurface::default();
        let mut handle = engine(transport).play(3, surface.clone());
        assert_eq!(handle.wait().await, ReplayStatus::Unavailable);
        assert!(surface.data().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn plays_fetched_recording() {
        let body = recording(&[(100.0, b"$ "), (100.25, b"ls\r\n")]);
        let transport = ScriptedTransport::new(move |_| respond_raw(200, &body));
        let surface = RecordingSurface::default();
        let mut handle = engine(transport).play(3, surface.clone());
        assert_eq!(handle.wait().await, ReplayStatus::Finished);
        assert_eq!(surface.data(), vec![b"$ ".to_vec(), b"ls\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn export_writes_gzip() {
        let body = recording(&[(1.0, b"a"), (2.0, b"b")]);
        let expected = body.clone();
        let transport = ScriptedTransport::new(move |_| respond_raw(200, &body));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.ndjson.gz");

        let count = engine(transport).export_recording(9, &path).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(read_recording_file(&path).unwrap(), expected);
    }
}
