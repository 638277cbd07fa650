//! Cancellable periodic tasks
//!
//! The first run starts immediately. A tick that arrives while the previous
//! run is still busy is skipped rather than queued.

use crate::logging::get_logger;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Clears the busy flag when a run ends, even by panic
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run `job` every `period` until `shutdown` is cancelled.
///
/// Runs in flight at cancellation are left to finish on their own.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let logger = get_logger("scheduler");
    tokio::spawn(async move {
        let busy = Arc::new(AtomicBool::new(false));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        logger.debug(&format!("{} every {} ms", name, period.as_millis()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if busy.swap(true, Ordering::AcqRel) {
                logger.trace(&format!("{} still running, tick skipped", name));
                continue;
            }
            let guard = BusyGuard(Arc::clone(&busy));
            let run = job();
            tokio::spawn(async move {
                let _guard = guard;
                run.await;
            });
        }
        logger.debug(&format!("{} stopped", name));
    })
}
