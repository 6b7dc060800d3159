//! Debounced background trigger primitive.
//!
//! A [`Trigger`] owns one worker task that runs a caller-supplied async
//! callback in response to [`Trigger::trigger`] requests:
//!
//! - Requests are non-blocking and coalesce: any number of requests that
//!   arrive while a run is pending or in flight fold into a single
//!   follow-up run.
//! - Runs are single-flight: the worker executes at most one callback at
//!   a time, and at most once per `min_interval`.
//! - [`Trigger::shutdown`] performs one final run before the worker
//!   exits, so state that is flushed by the callback is never lost to a
//!   request that arrived during teardown.
//!
//! The typical consumer is a "write dirty state to disk" task where
//! bursts of mutations should produce one write, not N.

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callback invoked by the trigger worker.
pub type TriggerFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Parameters for constructing a [`Trigger`].
pub struct TriggerParams {
    /// Name used in log output.
    pub name: String,

    /// Minimum interval between two callback runs. Requests arriving
    /// inside the interval are deferred and coalesced into one run.
    pub min_interval: Duration,

    /// The work to perform on each run.
    pub on_trigger: TriggerFn,
}

/// A debounced, single-flight trigger backed by one worker task.
pub struct Trigger {
    pending_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl Trigger {
    /// Spawn the worker task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(params: TriggerParams) -> Self {
        let (pending_tx, pending_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let name = params.name.clone();
        let handle = tokio::spawn(run_worker(
            params.name,
            params.min_interval,
            params.on_trigger,
            pending_rx,
            shutdown_rx,
        ));

        Self {
            pending_tx,
            shutdown_tx,
            worker: tokio::sync::Mutex::new(Some(handle)),
            name,
        }
    }

    /// Request a run. Never blocks; concurrent requests coalesce.
    pub fn trigger(&self) {
        self.pending_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Stop the worker, performing one final callback run first.
    ///
    /// Idempotent; the second and later calls return once the worker has
    /// exited.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(trigger = %self.name, error = %error, "Trigger worker panicked");
            }
        }
    }
}

async fn run_worker(
    name: String,
    min_interval: Duration,
    on_trigger: TriggerFn,
    mut pending_rx: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(trigger = %name, ?min_interval, "Trigger worker started");

    let mut last_run: Option<Instant> = None;

    loop {
        // Wait for a request, or for shutdown.
        tokio::select! {
            res = pending_rx.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                break;
            }
        }

        // Debounce: requests inside the interval wait it out and are
        // collapsed below.
        if let Some(at) = last_run {
            let elapsed = at.elapsed();
            if elapsed < min_interval {
                tokio::select! {
                    _ = tokio::time::sleep(min_interval - elapsed) => {}
                    _ = shutdown_rx.changed() => {
                        // The pending request is covered by the final
                        // run below.
                        break;
                    }
                }
            }
        }

        // Mark everything received so far as handled by this run.
        pending_rx.borrow_and_update();

        on_trigger().await;
        last_run = Some(Instant::now());
    }

    // One last run on the way out; cheap and makes shutdown flushes
    // unconditional.
    on_trigger().await;

    debug!(trigger = %name, "Trigger worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn counting_trigger(min_interval: Duration) -> (Trigger, Arc<AtomicU64>) {
        let runs = Arc::new(AtomicU64::new(0));
        let runs_clone = Arc::clone(&runs);
        let trigger = Trigger::new(TriggerParams {
            name: "test".to_string(),
            min_interval,
            on_trigger: Box::new(move || {
                let runs = Arc::clone(&runs_clone);
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            }),
        });
        (trigger, runs)
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_run() {
        let (trigger, runs) = counting_trigger(Duration::from_secs(60));

        // All requests land before the worker task gets to run (current
        // thread runtime), so they must collapse into a single run.
        for _ in 0..10 {
            trigger.trigger();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_requests_after_run_are_debounced() {
        let (trigger, runs) = counting_trigger(Duration::from_millis(50));

        trigger.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Burst inside the interval: exactly one follow-up run.
        for _ in 0..5 {
            trigger.trigger();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_run() {
        let (trigger, runs) = counting_trigger(Duration::from_secs(60));

        trigger.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // A request arriving just before shutdown is flushed by the
        // final run instead of waiting out the interval.
        trigger.trigger();
        trigger.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (trigger, runs) = counting_trigger(Duration::from_millis(10));

        trigger.shutdown().await;
        trigger.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
