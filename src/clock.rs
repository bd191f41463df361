//! The process-wide monotonic clock

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::trace;

/// Publishes the current wall time, in milliseconds, with microsecond tick granularity.
///
/// No other component reads the OS clock on the hot path; everything reads the cached
/// value this struct keeps up to date.
#[derive(Debug, Clone)]
pub struct Clock {
    now: Arc<AtomicI64>,
}

// === impl Clock ===

impl Clock {
    /// Spawns the background tick task and waits for its first tick.
    ///
    /// Returns once `now` has transitioned away from its initial zero value, so that any
    /// `Space::send` issued right after this call observes a real timestamp.
    pub async fn spawn() -> (Self, JoinHandle<()>) {
        let now = Arc::new(AtomicI64::new(0));

        let handle = {
            let now = now.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_micros(1));
                loop {
                    ticker.tick().await;
                    now.store(wall_time_ms(), Ordering::Relaxed);
                }
            })
        };

        while now.load(Ordering::Relaxed) == 0 {
            tokio::task::yield_now().await;
        }

        trace!(target: "clock", "clock running");

        (Self { now }, handle)
    }

    /// Returns the currently cached wall time in milliseconds since the epoch.
    pub fn now_ms(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

fn wall_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
