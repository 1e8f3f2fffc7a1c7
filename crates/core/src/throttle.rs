use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Single-permit rate limiter for outbound edits.
///
/// A background task refills the permit every `interval`; refilling a full
/// slot does nothing, so at most one claim succeeds per interval. Must be
/// created inside a tokio runtime. The refill task stops on drop.
#[derive(Debug)]
pub struct Throttler {
    permit: Arc<AtomicBool>,
    period: Duration,
    refill: JoinHandle<()>,
}

impl Throttler {
    pub fn new(period: Duration) -> Self {
        let permit = Arc::new(AtomicBool::new(true));
        let refill = tokio::spawn(refill_loop(Arc::clone(&permit), period));
        Self { permit, period, refill }
    }

    /// Claims the permit if it is available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        self.permit.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.refill.abort();
    }
}

async fn refill_loop(permit: Arc<AtomicBool>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        permit.store(true, Ordering::Release);
    }
}
