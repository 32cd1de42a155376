use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Owner of all background work of a manager.
///
/// Periodic tasks and one-shot tasks share one cancellation token;
/// [`Scheduler::shutdown`] is the only place they are stopped.
#[derive(Debug, Default)]
pub struct Scheduler {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until cancelled. The first run happens one
    /// period after spawning. A run in progress is not interrupted by
    /// cancellation; no new run starts afterwards.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                // `false` means the owner is gone
                if !tick().await {
                    break;
                }
            }
            debug!(task = name, "Periodic task stopped");
        });
    }

    /// Run one-shot background work; ignored once cancelled
    pub fn spawn<Fut>(&self, task: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return false;
        }
        self.tracker.spawn(task);
        true
    }

    /// Sleep for `duration`; returns `false` if cancelled first
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Number of tracked tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait for tracked tasks to finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
