//! Per-transfer control block: cancellation, progress reporting and
//! throttling, threaded through every chunk a backend moves.

use crate::error::{RemoteError, RemoteResult};
use crate::throttle::RateLimiter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Progress callback; reads the counters off the control it is given.
pub type ProgressFn = Arc<dyn Fn(&TransferControl) + Send + Sync>;

/// Granularity of cancellation checks while a blocking throttle pause runs.
const BLOCKING_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct TransferControl {
    token: CancellationToken,
    progress: Option<ProgressFn>,
    limiter: Arc<Mutex<RateLimiter>>,
    transferred: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    started: Arc<Mutex<Instant>>,
}

impl std::fmt::Debug for TransferControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferControl")
            .field("cancelled", &self.token.is_cancelled())
            .field("transferred", &self.transferred())
            .field("total", &self.total())
            .finish()
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl TransferControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            progress: None,
            limiter: Arc::new(Mutex::new(RateLimiter::unlimited())),
            transferred: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            started: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn with_progress(mut self, f: ProgressFn) -> Self {
        self.progress = Some(f);
        self
    }

    pub fn with_speed_limit(self, bytes_per_sec: u64) -> Self {
        self.set_speed_limit(bytes_per_sec);
        self
    }

    pub fn set_speed_limit(&self, bytes_per_sec: u64) {
        if let Ok(mut rl) = self.limiter.lock() {
            rl.set_limit(bytes_per_sec);
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> RemoteResult<()> {
        if self.is_cancelled() {
            Err(RemoteError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Mark the moment bytes start to move: restarts the clock behind
    /// [`elapsed`](Self::elapsed) and the throttle window, so time spent
    /// waiting for a connection counts toward neither.
    pub fn start(&self) {
        let now = Instant::now();
        if let Ok(mut started) = self.started.lock() {
            *started = now;
        }
        if let Ok(mut rl) = self.limiter.lock() {
            rl.reset(now);
        }
    }

    /// Time since [`start`](Self::start), or since creation.
    pub fn elapsed(&self) -> Duration {
        self.started.lock().map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Set the expected byte count once the backend knows it.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.report();
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    fn record(&self, n: u64) -> Option<Duration> {
        self.transferred.fetch_add(n, Ordering::Relaxed);
        self.report();
        self.limiter.lock().ok().and_then(|mut rl| rl.consume(n))
    }

    fn report(&self) {
        if let Some(cb) = &self.progress {
            cb(self);
        }
    }

    /// Account for `n` bytes just moved, from async code. Sleeps when the
    /// throttle asks for it and stops early on cancellation.
    pub async fn advance(&self, n: u64) -> RemoteResult<()> {
        self.check_cancelled()?;
        if let Some(pause) = self.record(n) {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.token.cancelled() => return Err(RemoteError::cancelled()),
            }
        }
        Ok(())
    }

    /// Blocking twin of [`advance`](Self::advance) for backends running on
    /// a blocking thread.
    pub fn advance_blocking(&self, n: u64) -> RemoteResult<()> {
        self.check_cancelled()?;
        if let Some(mut pause) = self.record(n) {
            while !pause.is_zero() {
                let step = pause.min(BLOCKING_SLICE);
                std::thread::sleep(step);
                pause -= step;
                self.check_cancelled()?;
            }
        }
        Ok(())
    }
}
