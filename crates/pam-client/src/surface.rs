//! Terminal surfaces: where live and replayed output is rendered.
//!
//! [`SurfaceSlot`] is the shared handle background tasks write through. Once
//! disposed it swallows every later write, so a cancelled channel or replay
//! can never touch a surface that has been torn down.

use std::io::{self, IsTerminal, Write};
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::sys::termios::{self, SetArg, Termios};
use tracing::{debug, warn};

pub trait TerminalSurface: Send + 'static {
    /// Render raw terminal bytes.
    fn write(&mut self, data: &[u8]);

    /// Re-fit the surface to its viewport. Local only.
    fn fit(&mut self) {}

    /// Release the surface's resources. Called exactly once.
    fn dispose(&mut self) {}
}

// ── Shared slot ─────────────────────────────────────────────────────

pub struct SurfaceSlot<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for SurfaceSlot<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TerminalSurface> SurfaceSlot<S> {
    pub fn new(surface: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(surface))),
        }
    }

    /// Write to the surface. Returns false once disposed.
    pub fn write(&self, data: &[u8]) -> bool {
        match self.lock().as_mut() {
            Some(surface) => {
                surface.write(data);
                true
            }
            None => false,
        }
    }

    pub fn fit(&self) {
        if let Some(surface) = self.lock().as_mut() {
            surface.fit();
        }
    }

    /// Dispose the surface. Returns true only for the call that disposed it.
    pub fn dispose(&self) -> bool {
        let taken = self.lock().take();
        match taken {
            Some(mut surface) => {
                surface.dispose();
                true
            }
            None => false,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Stdout surface ──────────────────────────────────────────────────

/// The process's own terminal. In raw mode the local line discipline is
/// switched off so every keystroke reaches the remote side verbatim; the
/// previous mode is restored on dispose or drop.
pub struct StdoutSurface {
    saved: Option<Termios>,
    size: Option<(u16, u16)>,
    disposed: bool,
}

impl StdoutSurface {
    pub fn new(raw: bool) -> Self {
        let saved = if raw { enter_raw_mode() } else { None };
        Self {
            saved,
            size: window_size(),
            disposed: false,
        }
    }

    /// Last fitted size as (cols, rows).
    pub fn size(&self) -> Option<(u16, u16)> {
        self.size
    }

    fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &saved) {
                warn!(error = %e, "failed to restore terminal mode");
            }
        }
    }
}

impl TerminalSurface for StdoutSurface {
    fn write(&mut self, data: &[u8]) {
        let mut out = io::stdout().lock();
        if out.write_all(data).and_then(|_| out.flush()).is_err() {
            debug!("stdout closed, dropping output");
        }
    }

    fn fit(&mut self) {
        self.size = window_size();
        if let Some((cols, rows)) = self.size {
            debug!(cols, rows, "terminal re-fitted");
        }
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.restore();
        let _ = io::stdout().flush();
    }
}

impl Drop for StdoutSurface {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn enter_raw_mode() -> Option<Termios> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return None;
    }
    let original = match termios::tcgetattr(stdin.as_fd()) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "failed to read terminal mode");
            return None;
        }
    };
    let mut raw = original.clone();
    termios::cfmakeraw(&mut raw);
    if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw) {
        warn!(error = %e, "failed to enter raw mode");
        return None;
    }
    Some(original)
}

/// Current window size of stdout as (cols, rows).
fn window_size() -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes into the winsize we pass.
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_col > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

// ── Test surface ────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::fake::RecordingSurface;
    use super::*;

    #[test]
    fn writes_stop_after_dispose() {
        let surface = RecordingSurface::default();
        let slot = SurfaceSlot::new(surface.clone());

        assert!(slot.write(b"before"));
        assert!(slot.dispose());
        assert!(!slot.write(b"after"));

        assert_eq!(surface.data(), vec![b"before".to_vec()]);
        assert!(slot.is_disposed());
    }

    #[test]
    fn dispose_runs_once_across_clones() {
        let surface = RecordingSurface::default();
        let slot = SurfaceSlot::new(surface.clone());
        let other = slot.clone();

        assert!(slot.dispose());
        assert!(!other.dispose());
        assert_eq!(surface.dispose_count(), 1);
    }

    #[test]
    fn fit_is_forwarded_until_disposed() {
        let surface = RecordingSurface::default();
        let slot = SurfaceSlot::new(surface.clone());
        slot.fit();
        slot.dispose();
        slot.fit();
        assert_eq!(*surface.fits.lock().unwrap(), 1);
    }
}
