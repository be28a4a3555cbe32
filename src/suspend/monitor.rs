//! Suspend monitor: a background timer that raises the arrest signal once.

use super::barrier::PartitionBarrier;
use super::window::SuspendWindow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// Edge-triggered "arrest now" flag checked by partitions at safe points.
#[derive(Debug, Default)]
pub struct ArrestSignal {
    raised: AtomicBool,
}

impl ArrestSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; true only for the call that raised it.
    pub fn raise(&self) -> bool {
        self.raised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

pub struct SuspendMonitor {
    handle: JoinHandle<()>,
}

impl SuspendMonitor {
    /// Start the timer for `window`, measured from `started`.
    pub fn spawn(
        window: SuspendWindow,
        started: Instant,
        signal: Arc<ArrestSignal>,
        barrier: Arc<PartitionBarrier>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(started + window.start()).await;
            if signal.raise() {
                info!(
                    "Suspend window reached after {:.3}s, arresting partitions",
                    started.elapsed().as_secs_f64()
                );
                barrier.wake();
            }
        });
        Self { handle }
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for SuspendMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
