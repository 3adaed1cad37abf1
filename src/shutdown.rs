//! Run flag and signal handling.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the installed handler names what it got. ctrlc does not report which
/// of SIGINT, SIGTERM or SIGHUP arrived.
pub const TERMINATION_SIGNAL: &str = "termination";

/// Cancellation token. Starts running and is cancelled at most once.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token. Returns `true` only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until cancelled, checking every `poll` and calling `on_heartbeat`
    /// each time `heartbeat` has elapsed.
    pub fn wait(&self, poll: Duration, heartbeat: Duration, mut on_heartbeat: impl FnMut()) {
        let mut last_beat = Instant::now();
        while !self.is_cancelled() {
            std::thread::sleep(poll);
            if last_beat.elapsed() >= heartbeat {
                on_heartbeat();
                last_beat = Instant::now();
            }
        }
    }
}

/// Termination signal handler bound to a token.
///
/// SIGINT, SIGTERM and SIGHUP all land in `handle`.
#[derive(Debug)]
pub struct SignalHandler {
    token: ShutdownToken,
    received: AtomicUsize,
}

impl SignalHandler {
    pub fn new(token: ShutdownToken) -> Arc<Self> {
        Arc::new(Self {
            token,
            received: AtomicUsize::new(0),
        })
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    /// Number of signals seen so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn handle(&self, source: &str) {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        if self.token.cancel() {
            log::info!("{} signal received, stopping", source);
        } else {
            log::info!("{} signal received again ({}), already stopping", source, count);
        }
    }

    /// Install as the process-wide termination handler.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        let handler = self.clone();
        ctrlc::set_handler(move || handler.handle(TERMINATION_SIGNAL))
            .context("error setting termination signal handler")
    }
}
