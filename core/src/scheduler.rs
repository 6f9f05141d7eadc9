//! Single-flight timer that drives compaction passes.
//!
//! The scheduler is either idle or running one pass. Ticks that arrive while
//! a pass is running are dropped rather than queued, so a slow pass never
//! stacks overlapping passes behind it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, info, trace, warn};

/// One unit of background work started by a scheduler tick.
#[async_trait]
pub trait CompactionTask: Send + Sync + 'static {
    async fn run_pass(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    /// A pass was already in flight; the tick is dropped.
    Skipped,
}

/// Busy flag shared by everything that may start a compaction pass in this
/// process. At most one [`GateGuard`] exists at a time.
#[derive(Default)]
pub struct CompactionGate {
    running: AtomicBool,
    idle: Notify,
}

impl CompactionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<GateGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard(self.clone()))
    }

    /// Wait for the in-flight pass, if any, then take the gate.
    pub async fn acquire(self: &Arc<Self>) -> GateGuard {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            self.wait_idle().await;
        }
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }
}

/// Releases the gate when dropped, including when the pass panics.
pub struct GateGuard(Arc<CompactionGate>);

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.idle.notify_waiters();
    }
}

#[derive(Clone)]
pub struct CompactionScheduler {
    task: Arc<dyn CompactionTask>,
    interval: Duration,
    gate: Arc<CompactionGate>,
}

impl CompactionScheduler {
    pub fn new(task: Arc<dyn CompactionTask>, interval: Duration) -> Self {
        Self::with_gate(task, interval, CompactionGate::new())
    }

    /// Share `gate` with other callers that run passes outside the timer.
    pub fn with_gate(
        task: Arc<dyn CompactionTask>,
        interval: Duration,
        gate: Arc<CompactionGate>,
    ) -> Self {
        Self {
            task,
            interval: interval.max(Duration::from_millis(1)),
            gate,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_busy()
    }

    /// Start a pass unless one is already in flight.
    pub fn tick(&self) -> TickOutcome {
        let Some(guard) = self.gate.try_acquire() else {
            trace!("compaction pass still running; dropping tick");
            return TickOutcome::Skipped;
        };

        let task = self.task.clone();
        tokio::spawn(async move {
            let _guard = guard;
            task.run_pass().await;
        });
        TickOutcome::Started
    }

    /// Wait until no pass is in flight.
    pub async fn wait_idle(&self) {
        self.gate.wait_idle().await
    }

    /// Spawn the timer loop. The first tick fires one interval from now.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + scheduler.interval, scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = scheduler.interval.as_millis() as u64,
                "doc compaction scheduler started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.tick();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("doc compaction scheduler timer stopped");
        });

        SchedulerHandle {
            scheduler: self,
            shutdown_tx,
            timer,
        }
    }
}

pub struct SchedulerHandle {
    scheduler: CompactionScheduler,
    shutdown_tx: watch::Sender<bool>,
    timer: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &CompactionScheduler {
        &self.scheduler
    }

    /// Stop issuing ticks, then give an in-flight pass up to `grace` to
    /// finish. Returns `true` when no pass is running on return; otherwise
    /// the pass is abandoned and its unconsumed updates wait for the next run.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.timer.await {
            warn!(error = %err, "doc compaction scheduler timer ended abnormally");
        }

        if !self.scheduler.is_running() {
            return true;
        }

        match timeout(grace, self.scheduler.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "abandoning in-flight doc compaction pass on shutdown"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Semaphore;

    use super::*;

    /// Pass that blocks until released and records call and overlap counts.
    struct GatedTask {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        gate: Semaphore,
    }

    impl Default for GatedTask {
        fn default() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            }
        }
    }

    impl GatedTask {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn release(&self, passes: usize) {
            self.gate.add_permits(passes);
        }

        async fn wait_for_calls(&self, expected: usize) {
            while self.calls() < expected {
                tokio::task::yield_now().await;
            }
        }
    }

    #[async_trait]
    impl CompactionTask for GatedTask {
        async fn run_pass(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct PanickingTask;

    #[async_trait]
    impl CompactionTask for PanickingTask {
        async fn run_pass(&self) {
            panic!("pass failed");
        }
    }

    #[tokio::test]
    async fn tick_while_running_is_dropped() {
        let task = Arc::new(GatedTask::default());
        let scheduler = CompactionScheduler::new(task.clone(), Duration::from_secs(60));

        assert_eq!(scheduler.tick(), TickOutcome::Started);
        task.wait_for_calls(1).await;

        assert_eq!(scheduler.tick(), TickOutcome::Skipped);
        assert!(scheduler.is_running());
        assert_eq!(task.calls(), 1);

        task.release(1);
        scheduler.wait_idle().await;
        assert!(!scheduler.is_running());

        assert_eq!(scheduler.tick(), TickOutcome::Started);
        task.wait_for_calls(2).await;
        assert_eq!(task.calls(), 2);
        task.release(1);
        scheduler.wait_idle().await;
    }

    #[tokio::test]
    async fn shared_gate_serialises_manual_passes_with_ticks() {
        let task = Arc::new(GatedTask::default());
        let gate = CompactionGate::new();
        let scheduler =
            CompactionScheduler::with_gate(task.clone(), Duration::from_secs(60), gate.clone());

        let manual = gate.try_acquire().expect("gate free");
        assert_eq!(scheduler.tick(), TickOutcome::Skipped);
        assert!(scheduler.is_running());
        drop(manual);
        assert!(!scheduler.is_running());

        assert_eq!(scheduler.tick(), TickOutcome::Started);
        task.wait_for_calls(1).await;
        assert!(gate.try_acquire().is_none());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move {
                let _guard = gate.acquire().await;
            }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        task.release(1);
        waiter.await.expect("manual pass took the gate");
        assert!(!gate.is_busy());
        assert_eq!(task.calls(), 1);
    }

    #[tokio::test]
    async fn panicking_pass_returns_scheduler_to_idle() {
        let scheduler = CompactionScheduler::new(Arc::new(PanickingTask), Duration::from_secs(1));

        assert_eq!(scheduler.tick(), TickOutcome::Started);
        scheduler.wait_idle().await;

        assert!(!scheduler.is_running());
        assert_eq!(scheduler.tick(), TickOutcome::Started);
        scheduler.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pass_never_overlaps_with_the_next_tick() {
        let task = Arc::new(GatedTask::default());
        let interval = Duration::from_millis(100);
        let handle = CompactionScheduler::new(task.clone(), interval).start();

        tokio::time::sleep(interval * 10).await;
        assert_eq!(task.calls(), 1);
        assert!(handle.scheduler().is_running());

        task.release(1);
        handle.scheduler().wait_idle().await;
        tokio::time::sleep(interval * 2).await;
        assert_eq!(task.calls(), 2);
        assert_eq!(task.max_active.load(Ordering::SeqCst), 1);

        task.release(usize::from(u8::MAX));
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_future_ticks() {
        let task = Arc::new(GatedTask::default());
        task.release(usize::from(u8::MAX));
        let interval = Duration::from_millis(50);
        let handle = CompactionScheduler::new(task.clone(), interval).start();

        tokio::time::sleep(interval * 3 + interval / 2).await;
        let calls_before = task.calls();
        assert!(calls_before >= 1);

        assert!(handle.shutdown(Duration::from_secs(1)).await);
        tokio::time::sleep(interval * 10).await;
        assert_eq!(task.calls(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_pass_after_grace() {
        let task = Arc::new(GatedTask::default());
        let interval = Duration::from_millis(10);
        let handle = CompactionScheduler::new(task.clone(), interval).start();

        tokio::time::sleep(interval * 2).await;
        assert!(handle.scheduler().is_running());

        assert!(!handle.shutdown(Duration::from_millis(50)).await);
        task.release(1);
    }
}
