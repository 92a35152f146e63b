//! Periodic sweep actor

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use vmexpire_api::SweepSummary;

use crate::{Clock, ExpirationEngine, SweepReport};

/// Drives [`ExpirationEngine::run_once`] on a fixed interval.
///
/// At most one sweep runs at a time: a tick or a manual trigger that arrives
/// while a sweep is in flight is skipped, not queued.
pub struct Scheduler {
    engine: Arc<ExpirationEngine>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    in_flight: tokio::sync::Mutex<()>,
    last_sweep: Mutex<Option<SweepSummary>>,
    skipped: AtomicU64,
}

impl Scheduler {
    pub fn new(engine: Arc<ExpirationEngine>, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        Self {
            engine,
            clock,
            tick_interval,
            in_flight: tokio::sync::Mutex::new(()),
            last_sweep: Mutex::new(None),
            skipped: AtomicU64::new(0),
        }
    }

    /// Run a sweep now unless one is already running
    pub async fn try_sweep(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(skipped, "Sweep already in flight, skipping");
            return None;
        };

        let report = self.engine.run_once(self.clock.now()).await;
        *self.last_sweep.lock().unwrap() = Some(report.summary.clone());
        Some(report)
    }

    pub fn last_sweep(&self) -> Option<SweepSummary> {
        self.last_sweep.lock().unwrap().clone()
    }

    /// Sweeps skipped because another was in flight
    pub fn skipped_sweeps(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Tick until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.tick_interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.try_sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{t0, Harness};
    use vmexpire_config::ExpirationPolicy;

    #[tokio::test]
    async fn overlapping_sweep_is_skipped() {
        let h = Harness::inline(ExpirationPolicy::default());
        h.register("vm-1", "proj").await;
        h.clock.set(t0() + chrono::Duration::days(50));
        h.notifier.set_delay(Some(Duration::from_millis(200)));

        let scheduler = Scheduler::new(h.engine.clone(), h.clock.clone(), Duration::from_secs(60));
        let (first, second) = tokio::join!(scheduler.try_sweep(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scheduler.try_sweep().await
        });

        assert_eq!(first.unwrap().summary.notified, 1);
        assert!(second.is_none());
        assert_eq!(scheduler.skipped_sweeps(), 1);
        assert_eq!(scheduler.last_sweep().unwrap().notified, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = Harness::inline(ExpirationPolicy::default());
        let scheduler = Arc::new(Scheduler::new(
            h.engine.clone(),
            h.clock.clone(),
            Duration::from_millis(10),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(scheduler.last_sweep().is_some());
    }
}
